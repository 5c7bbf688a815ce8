use std::str::FromStr;

use parking_lot::RwLock;

use filament_primitives::AuthorityId;

use crate::ed25519::Keypair;
use crate::Error;

/// The key namespaces the host routes keys into. Names are the 4-character
/// tags used on disk and over RPC.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    Account,
    Babe,
    Grandpa,
}

impl KeyType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Account => "acco",
            Self::Babe => "babe",
            Self::Grandpa => "gran",
        }
    }
}

impl FromStr for KeyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "acco" => Ok(Self::Account),
            "babe" => Ok(Self::Babe),
            "gran" => Ok(Self::Grandpa),
            other => Err(Error::InvalidKeystoreName(other.to_string())),
        }
    }
}

/// A set of keypairs for one key type.
#[derive(Default)]
pub struct Keystore {
    keys: RwLock<Vec<Keypair>>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, keypair: Keypair) {
        let mut keys = self.keys.write();
        let id = AuthorityId::from(keypair.public());
        if keys.iter().any(|k| AuthorityId::from(k.public()) == id) {
            return;
        }
        keys.push(keypair);
    }

    pub fn public_keys(&self) -> Vec<AuthorityId> {
        self.keys.read().iter().map(|k| AuthorityId::from(k.public())).collect()
    }

    pub fn get_keypair(&self, id: &AuthorityId) -> Option<Keypair> {
        self.keys.read().iter().find(|k| &AuthorityId::from(k.public()) == id).cloned()
    }

    pub fn has_key(&self, id: &AuthorityId) -> bool {
        self.get_keypair(id).is_some()
    }

    pub fn size(&self) -> usize {
        self.keys.read().len()
    }

    fn clear(&self) {
        self.keys.write().clear();
    }
}

/// The process-wide keystore: one typed namespace per [`KeyType`].
///
/// Initialised at startup, handed by reference to the core and authoring
/// services, cleared at shutdown.
#[derive(Default)]
pub struct GlobalKeystore {
    acco: Keystore,
    babe: Keystore,
    gran: Keystore,
}

impl GlobalKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keystore(&self, key_type: KeyType) -> &Keystore {
        match key_type {
            KeyType::Account => &self.acco,
            KeyType::Babe => &self.babe,
            KeyType::Grandpa => &self.gran,
        }
    }

    /// Routes a keypair into the namespace named by `name`.
    pub fn insert_key(&self, name: &str, keypair: Keypair) -> Result<(), Error> {
        let key_type: KeyType = name.parse()?;
        self.keystore(key_type).insert(keypair);
        Ok(())
    }

    /// Generates a fresh keypair from a seed in the namespace named by
    /// `name`. Only the ED25519-backed GRANDPA namespace can generate keys
    /// here; BABE and account keys use schemes provided by the external
    /// crypto host.
    pub fn generate_key(&self, name: &str, seed: &[u8; 32]) -> Result<AuthorityId, Error> {
        let key_type: KeyType = name.parse()?;
        if key_type != KeyType::Grandpa {
            return Err(Error::KeyTypeNotSupported(name.to_string()));
        }
        let keypair = Keypair::from_seed(seed);
        let public = AuthorityId::from(keypair.public());
        self.keystore(key_type).insert(keypair);
        Ok(public)
    }

    pub fn has_key(&self, id: &AuthorityId, name: &str) -> Result<bool, Error> {
        let key_type: KeyType = name.parse()?;
        Ok(self.keystore(key_type).has_key(id))
    }

    /// Wipes every namespace. Called once at shutdown.
    pub fn clear(&self) {
        self.acco.clear();
        self.babe.clear();
        self.gran.clear();
    }
}
