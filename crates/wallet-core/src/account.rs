//! Account model: BIP32 hierarchical-deterministic derivation across the
//! wallet's four account variants (legacy "Old" pre-BIP32, single-sig BIP32,
//! 2-of-2 and 2-of-3 multisig P2SH).
//!
//! The six well-known derivation prefixes, in the order the legacy source
//! assembled them: `m/0'/` is the single-sig leg, `m/1'/` and `m/2'/` are
//! the two legs of the 2-of-2, `m/3'/`, `m/4'/` and `m/5'/` are the three
//! legs of the 2-of-3.
use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::{
    bip32::{ChainCode, ChildNumber, Xpriv, Xpub},
    hashes::{sha256d, Hash},
    secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification},
    Address, Network, PrivateKey, PubkeyHash, ScriptBuf,
};
use serde::{Deserialize, Serialize};
use wallet_common::ChangeFlag;

use crate::error::Error;

/// The six master-key-registry prefixes, in fixed derivation order.
pub const MASTER_KEY_PREFIXES: [&str; 6] = ["m/0'/", "m/1'/", "m/2'/", "m/3'/", "m/4'/", "m/5'/"];

/// One entry of the public half of the master key registry (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterPublicKey {
    pub chain_code: [u8; 32],
    pub pubkey: PublicKey,
}

/// The two master-key maps, keyed by derivation-path prefix.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MasterKeyRegistry {
    pub public: HashMap<String, MasterPublicKey>,
    /// `pw_encode`d hex of the 32-byte secret key. Absent for watch-only
    /// wallets, or for legs whose branch has been de-seeded.
    pub private: HashMap<String, String>,
}

impl MasterKeyRegistry {
    /// Derives all six master keypairs from the raw seed via BIP32 and
    /// records them under their well-known prefixes. `passphrase` encrypts
    /// the resulting private keys at rest.
    pub fn from_seed<C: Signing>(
        secp: &Secp256k1<C>,
        network: Network,
        seed: &[u8],
        passphrase: &str,
    ) -> Result<Self, Error> {
        let master = Xpriv::new_master(network, seed)?;
        let mut registry = MasterKeyRegistry::default();

        for (i, prefix) in MASTER_KEY_PREFIXES.iter().enumerate() {
            let path = [ChildNumber::from_hardened_idx(i as u32).map_err(|_| Error::InvalidDerivationIndex)?];
            let leg_xprv = master.derive_priv(secp, &path)?;
            let leg_xpub = Xpub::from_priv(secp, &leg_xprv);

            registry.public.insert(
                prefix.to_string(),
                MasterPublicKey {
                    chain_code: leg_xpub.chain_code.to_bytes(),
                    pubkey: leg_xpub.public_key,
                },
            );
            registry.private.insert(
                prefix.to_string(),
                wallet_crypto::pw_encode(&leg_xprv.private_key.secret_bytes(), passphrase),
            );
        }

        Ok(registry)
    }

    pub fn public_leg(&self, prefix: &str) -> Option<&MasterPublicKey> {
        self.public.get(prefix)
    }

    /// Decrypts and returns the secret key for `prefix`, verifying it
    /// matches the known public key (mirrors Electrum's
    /// `get_master_private_key`, which re-derives the pubkey and asserts
    /// equality before trusting the decrypted bytes).
    pub fn private_leg<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        prefix: &str,
        passphrase: &str,
    ) -> Result<SecretKey, Error> {
        let encrypted = self.private.get(prefix).ok_or(Error::InvalidPassword)?;
        let decrypted = wallet_crypto::pw_decode(encrypted, passphrase).map_err(|_| Error::InvalidPassword)?;
        let secret = SecretKey::from_slice(&decrypted).map_err(|_| Error::InvalidPassword)?;

        let expected = self.public.get(prefix).ok_or(Error::InvalidPassword)?;
        if PublicKey::from_secret_key(secp, &secret) != expected.pubkey {
            return Err(Error::InvalidPassword);
        }
        Ok(secret)
    }
}

/// Derives the leaf pubkey at `/change/index` from a leg's master public key.
pub fn derive_leg_pubkey<C: Verification>(
    secp: &Secp256k1<C>,
    leg: &MasterPublicKey,
    change: ChangeFlag,
    index: u32,
) -> Result<PublicKey, Error> {
    let xpub = Xpub {
        network: bitcoin::NetworkKind::Main,
        depth: 0,
        parent_fingerprint: Default::default(),
        child_number: ChildNumber::Normal { index: 0 },
        public_key: leg.pubkey,
        chain_code: ChainCode::from(leg.chain_code),
    };
    let path = [
        ChildNumber::Normal { index: change.as_u8() as u32 },
        ChildNumber::Normal { index },
    ];
    Ok(xpub.derive_pub(secp, &path)?.public_key)
}

/// Derives the leaf private key at `/change/index` from a leg's master
/// secret key and chain code.
pub fn derive_leg_privkey<C: Signing>(
    secp: &Secp256k1<C>,
    leg: &MasterPublicKey,
    secret: SecretKey,
    change: ChangeFlag,
    index: u32,
) -> Result<SecretKey, Error> {
    let xprv = Xpriv {
        network: bitcoin::NetworkKind::Main,
        depth: 0,
        parent_fingerprint: Default::default(),
        child_number: ChildNumber::Normal { index: 0 },
        private_key: secret,
        chain_code: ChainCode::from(leg.chain_code),
    };
    let path = [
        ChildNumber::Normal { index: change.as_u8() as u32 },
        ChildNumber::Normal { index },
    ];
    Ok(xprv.derive_priv(secp, &path)?.private_key)
}

/// Builds the 2-of-2/2-of-3 multisig redeem script. Pubkeys are pushed in
/// leg order (1,2 or 3,4,5) — the legacy source never applies BIP67 sorting
/// here, and changing that would break compatibility with existing wallets,
/// so this implementation preserves the same order deliberately.
pub fn multisig_redeem_script(pubkeys: &[PublicKey], threshold: u8) -> ScriptBuf {
    use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
    use bitcoin::script::{Builder, PushBytesBuf};

    let mut builder = Builder::new().push_int(threshold as i64);
    for pk in pubkeys {
        let mut bytes = PushBytesBuf::new();
        bytes.extend_from_slice(&pk.serialize()).expect("33 bytes fits a push");
        builder = builder.push_slice(bytes);
    }
    builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Recovers the pubkeys pushed into a multisig redeem script, in push order
/// — the inverse of [`multisig_redeem_script`], used when signing to line up
/// an available private key with its slot in the scriptSig.
pub fn pubkeys_in_redeem_script(script: &ScriptBuf) -> Vec<PublicKey> {
    script
        .instructions()
        .filter_map(|i| i.ok())
        .filter_map(|i| match i {
            bitcoin::script::Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
            _ => None,
        })
        .collect()
}

/// Legacy pre-BIP32 ("Old") derivation. Electrum's original client predates
/// BIP32: child keys are produced by tweaking the master pubkey point with
/// a scalar derived from `sha256d("<index>:<change>:" || master_pubkey)`,
/// and the master keypair itself comes from 100_000 rounds of sha256d
/// stretching of the raw seed rather than a BIP32 master node.
pub mod old {
    use super::*;

    /// Stretches the raw seed into a scalar usable as the master secret key.
    /// `account.py` (the Electrum "old" account implementation) was not
    /// part of the retrievable original source; this reproduces its
    /// publicly documented key-stretching scheme.
    pub fn stretch_key(seed: &[u8]) -> SecretKey {
        let mut digest = seed.to_vec();
        for _ in 0..100_000 {
            let mut input = Vec::with_capacity(digest.len() + seed.len());
            input.extend_from_slice(&digest);
            input.extend_from_slice(seed);
            digest = sha256d::Hash::hash(&input).to_byte_array().to_vec();
        }

        // sha256d output is already a valid scalar with overwhelming
        // probability; fall back to re-hashing on the astronomically rare
        // out-of-range case rather than panicking.
        let mut candidate = digest;
        loop {
            if let Ok(key) = SecretKey::from_slice(&candidate) {
                return key;
            }
            candidate = sha256d::Hash::hash(&candidate).to_byte_array().to_vec();
        }
    }

    pub fn master_public_key<C: Signing>(secp: &Secp256k1<C>, seed: &[u8]) -> PublicKey {
        PublicKey::from_secret_key(secp, &stretch_key(seed))
    }

    fn sequence_scalar(mpk_uncompressed_xy: &[u8; 64], change: ChangeFlag, index: u32) -> Scalar {
        let mut input = format!("{}:{}:", index, change.as_u8()).into_bytes();
        input.extend_from_slice(mpk_uncompressed_xy);
        let mut digest = sha256d::Hash::hash(&input).to_byte_array();
        loop {
            if let Ok(s) = Scalar::from_be_bytes(digest) {
                return s;
            }
            digest = sha256d::Hash::hash(&digest).to_byte_array();
        }
    }

    fn uncompressed_xy<C: Signing + Verification>(secp: &Secp256k1<C>, mpk: &PublicKey) -> [u8; 64] {
        let _ = secp;
        let serialized = mpk.serialize_uncompressed();
        let mut xy = [0u8; 64];
        xy.copy_from_slice(&serialized[1..]);
        xy
    }

    pub fn derive_pubkey<C: Signing + Verification>(
        secp: &Secp256k1<C>,
        mpk: &PublicKey,
        change: ChangeFlag,
        index: u32,
    ) -> Result<PublicKey, Error> {
        let xy = uncompressed_xy(secp, mpk);
        let z = sequence_scalar(&xy, change, index);
        Ok(mpk.add_exp_tweak(secp, &z)?)
    }

    pub fn derive_privkey<C: Signing + Verification>(
        secp: &Secp256k1<C>,
        mpk: &PublicKey,
        seed: &[u8],
        change: ChangeFlag,
        index: u32,
    ) -> Result<SecretKey, Error> {
        let xy = uncompressed_xy(secp, mpk);
        let z = sequence_scalar(&xy, change, index);
        let master_secret = stretch_key(seed);
        Ok(master_secret.add_tweak(&z)?)
    }

    /// Old-account addresses are uncompressed P2PKH, version byte 0x00.
    pub fn address_for_pubkey(pubkey: &PublicKey, network: Network) -> Address {
        let hash = PubkeyHash::hash(&pubkey.serialize_uncompressed());
        Address::p2pkh(hash, network)
    }
}

/// A BIP32 leg identifies one of the six master-key prefixes together with
/// the derivation index shared by the account (the account index `i`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub prefix_index: u8, // 0..=5, indexes MASTER_KEY_PREFIXES
    pub account_index: u32,
}

impl Leg {
    pub fn prefix(&self) -> &'static str {
        MASTER_KEY_PREFIXES[self.prefix_index as usize]
    }
}

/// The per-change-flag address chains an account grows as it's used.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressChains {
    pub external: Vec<String>,
    pub internal: Vec<String>,
}

impl AddressChains {
    pub fn chain(&self, change: ChangeFlag) -> &Vec<String> {
        match change {
            ChangeFlag::External => &self.external,
            ChangeFlag::Internal => &self.internal,
        }
    }

    pub fn chain_mut(&mut self, change: ChangeFlag) -> &mut Vec<String> {
        match change {
            ChangeFlag::External => &mut self.external,
            ChangeFlag::Internal => &mut self.internal,
        }
    }
}

/// A wallet account: one of the four variants the original source supports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Account {
    /// Pre-BIP32 legacy account. Only ever exists as account id `0`.
    Old { master_pubkey: PublicKey, chains: AddressChains },
    /// Single-sig BIP32 account (`m/0'/<i>`).
    Single { leg: Leg, chains: AddressChains },
    /// 2-of-2 P2SH multisig (`m/1'/<i> & m/2'/<i>`).
    TwoOfTwo { legs: [Leg; 2], chains: AddressChains },
    /// 2-of-3 P2SH multisig (`m/3'/<i> & m/4'/<i> & m/5'/<i>`).
    TwoOfThree { legs: [Leg; 3], chains: AddressChains },
}

impl Account {
    pub fn chains(&self) -> &AddressChains {
        match self {
            Account::Old { chains, .. }
            | Account::Single { chains, .. }
            | Account::TwoOfTwo { chains, .. }
            | Account::TwoOfThree { chains, .. } => chains,
        }
    }

    pub fn chains_mut(&mut self) -> &mut AddressChains {
        match self {
            Account::Old { chains, .. }
            | Account::Single { chains, .. }
            | Account::TwoOfTwo { chains, .. }
            | Account::TwoOfThree { chains, .. } => chains,
        }
    }

    pub fn list_addresses(&self, change: ChangeFlag) -> &Vec<String> {
        self.chains().chain(change)
    }

    /// Canonical account-id string, per spec.md §3.
    pub fn id_string(&self) -> String {
        match self {
            Account::Old { .. } => "0".to_string(),
            Account::Single { leg, .. } => format!("m/0'/{}", leg.account_index),
            Account::TwoOfTwo { legs, .. } => {
                format!("m/1'/{} & m/2'/{}", legs[0].account_index, legs[1].account_index)
            }
            Account::TwoOfThree { legs, .. } => format!(
                "m/3'/{} & m/4'/{} & m/5'/{}",
                legs[0].account_index, legs[1].account_index, legs[2].account_index
            ),
        }
    }

    pub fn account_type(&self) -> &'static str {
        match self {
            Account::Old { .. } | Account::Single { .. } => "1",
            Account::TwoOfTwo { .. } => "2of2",
            Account::TwoOfThree { .. } => "2of3",
        }
    }

    fn leg_pubkeys<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        change: ChangeFlag,
        index: u32,
    ) -> Result<Vec<PublicKey>, Error> {
        let legs: &[Leg] = match self {
            Account::Old { .. } => return Ok(vec![]),
            Account::Single { leg, .. } => std::slice::from_ref(leg),
            Account::TwoOfTwo { legs, .. } => legs,
            Account::TwoOfThree { legs, .. } => legs,
        };

        legs.iter()
            .map(|leg| {
                let master = registry.public_leg(leg.prefix()).ok_or(Error::AccountNotFound(leg.prefix().to_string()))?;
                derive_leg_pubkey(secp, master, change, index)
            })
            .collect()
    }

    /// Returns the redeem script for a P2SH multisig account, or `None` for
    /// single-sig/old accounts (spec.md §4.2).
    pub fn redeem_script_at<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        change: ChangeFlag,
        index: u32,
    ) -> Result<Option<ScriptBuf>, Error> {
        match self {
            Account::Old { .. } | Account::Single { .. } => Ok(None),
            Account::TwoOfTwo { .. } => {
                let pubkeys = self.leg_pubkeys(secp, registry, change, index)?;
                Ok(Some(multisig_redeem_script(&pubkeys, 2)))
            }
            Account::TwoOfThree { .. } => {
                let pubkeys = self.leg_pubkeys(secp, registry, change, index)?;
                Ok(Some(multisig_redeem_script(&pubkeys, 2)))
            }
        }
    }

    /// Derives the address at `(change, index)`, independent of whether it
    /// has already been materialized into the chain.
    pub fn address_at<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        network: Network,
        change: ChangeFlag,
        index: u32,
    ) -> Result<Address, Error> {
        match self {
            Account::Old { master_pubkey, .. } => {
                let pk = old::derive_pubkey(secp, master_pubkey, change, index)?;
                Ok(old::address_for_pubkey(&pk, network))
            }
            Account::Single { leg, .. } => {
                let master = registry.public_leg(leg.prefix()).ok_or(Error::AccountNotFound(leg.prefix().to_string()))?;
                let pk = derive_leg_pubkey(secp, master, change, index)?;
                Ok(Address::p2pkh(PubkeyHash::hash(&pk.serialize()), network))
            }
            Account::TwoOfTwo { .. } | Account::TwoOfThree { .. } => {
                let redeem = self
                    .redeem_script_at(secp, registry, change, index)?
                    .expect("multisig accounts always carry a redeem script");
                Ok(Address::p2sh(&redeem, network).expect("redeem script is within the size limit"))
            }
        }
    }

    /// Appends a freshly derived address to the chain and returns it.
    pub fn create_new_address<C: Verification>(
        &mut self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        network: Network,
        change: ChangeFlag,
    ) -> Result<String, Error> {
        let index = self.chains().chain(change).len() as u32;
        let addr = self.address_at(secp, registry, network, change, index)?.to_string();
        self.chains_mut().chain_mut(change).push(addr.clone());
        Ok(addr)
    }

    pub fn first_address<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        network: Network,
    ) -> Result<String, Error> {
        Ok(self.address_at(secp, registry, network, ChangeFlag::External, 0)?.to_string())
    }

    /// Returns the WIF private key(s) required to sign on behalf of this
    /// account at `(change, index)`: one for single-sig/old, one per leg
    /// whose master private key is locally available for multisig (partial
    /// signing is allowed, spec.md §4.4 `get_private_key`).
    pub fn private_keys_at<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        network: Network,
        change: ChangeFlag,
        index: u32,
        seed: Option<&[u8]>,
        passphrase: &str,
    ) -> Result<Vec<PrivateKey>, Error> {
        match self {
            Account::Old { master_pubkey, .. } => {
                let seed = seed.ok_or(Error::InvalidPassword)?;
                let secret = old::derive_privkey(secp, master_pubkey, seed, change, index)?;
                Ok(vec![PrivateKey { compressed: false, network: network.into(), inner: secret }])
            }
            Account::Single { leg, .. } => {
                let master = registry.public_leg(leg.prefix()).ok_or(Error::AccountNotFound(leg.prefix().to_string()))?;
                let secret = registry.private_leg(secp, leg.prefix(), passphrase)?;
                let child = derive_leg_privkey(secp, master, secret, change, index)?;
                Ok(vec![PrivateKey { compressed: true, network: network.into(), inner: child }])
            }
            Account::TwoOfTwo { legs, .. } => self.multisig_privkeys(secp, registry, network, legs, change, index, passphrase),
            Account::TwoOfThree { legs, .. } => self.multisig_privkeys(secp, registry, network, legs, change, index, passphrase),
        }
    }

    fn multisig_privkeys<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        registry: &MasterKeyRegistry,
        network: Network,
        legs: &[Leg],
        change: ChangeFlag,
        index: u32,
        passphrase: &str,
    ) -> Result<Vec<PrivateKey>, Error> {
        let mut out = Vec::new();
        for leg in legs {
            let Some(master) = registry.public_leg(leg.prefix()) else { continue };
            let Ok(secret) = registry.private_leg(secp, leg.prefix(), passphrase) else { continue };
            let child = derive_leg_privkey(secp, master, secret, change, index)?;
            out.push(PrivateKey { compressed: true, network: network.into(), inner: child });
        }
        Ok(out)
    }
}

/// Parses an account id string back into its component legs, per
/// spec.md §3's account-id formats. Returns `None` for the legacy `"0"` id.
pub fn parse_account_id(id: &str) -> Option<Vec<(String, u32)>> {
    if id == "0" {
        return None;
    }
    let mut legs = Vec::new();
    for part in id.split('&') {
        let part = part.trim();
        let (root, idx) = part.rsplit_once('/')?;
        let idx: u32 = idx.parse().ok()?;
        legs.push((format!("{root}/"), idx));
    }
    Some(legs)
}

impl FromStr for Leg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (root, idx) = s.rsplit_once('/').ok_or(Error::InvalidAccountType(s.to_string()))?;
        let prefix = format!("{root}/");
        let prefix_index = MASTER_KEY_PREFIXES
            .iter()
            .position(|p| *p == prefix)
            .ok_or(Error::InvalidAccountType(s.to_string()))? as u8;
        let account_index: u32 = idx.parse().map_err(|_| Error::InvalidAccountType(s.to_string()))?;
        Ok(Leg { prefix_index, account_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    fn registry() -> (Secp256k1<bitcoin::secp256k1::All>, MasterKeyRegistry) {
        let secp = Secp256k1::new();
        let seed = [0x42u8; 16];
        let registry = MasterKeyRegistry::from_seed(&secp, Network::Testnet, &seed, "").unwrap();
        (secp, registry)
    }

    #[test]
    fn single_sig_account_id() {
        let account = Account::Single {
            leg: Leg { prefix_index: 0, account_index: 3 },
            chains: AddressChains::default(),
        };
        assert_eq!(account.id_string(), "m/0'/3");
        assert_eq!(account.account_type(), "1");
    }

    #[test]
    fn two_of_two_account_id() {
        let account = Account::TwoOfTwo {
            legs: [
                Leg { prefix_index: 1, account_index: 0 },
                Leg { prefix_index: 2, account_index: 0 },
            ],
            chains: AddressChains::default(),
        };
        assert_eq!(account.id_string(), "m/1'/0 & m/2'/0");
    }

    #[test]
    fn single_sig_derives_distinct_addresses_per_index() {
        let (secp, registry) = registry();
        let mut account = Account::Single {
            leg: Leg { prefix_index: 0, account_index: 0 },
            chains: AddressChains::default(),
        };
        let a0 = account.create_new_address(&secp, &registry, Network::Testnet, ChangeFlag::External).unwrap();
        let a1 = account.create_new_address(&secp, &registry, Network::Testnet, ChangeFlag::External).unwrap();
        assert_ne!(a0, a1);
        assert_eq!(account.list_addresses(ChangeFlag::External).len(), 2);
    }

    #[test]
    fn two_of_three_redeem_script_preserves_leg_order() {
        let (secp, registry) = registry();
        let account = Account::TwoOfThree {
            legs: [
                Leg { prefix_index: 3, account_index: 0 },
                Leg { prefix_index: 4, account_index: 0 },
                Leg { prefix_index: 5, account_index: 0 },
            ],
            chains: AddressChains::default(),
        };
        let redeem = account
            .redeem_script_at(&secp, &registry, ChangeFlag::External, 0)
            .unwrap()
            .unwrap();
        // OP_2 <pk1> <pk2> <pk3> OP_3 OP_CHECKMULTISIG
        assert!(redeem.as_bytes().len() > 3 * 33);
    }

    #[test]
    fn old_account_pubkey_derivation_is_deterministic() {
        let secp = Secp256k1::new();
        let seed = b"0123456789abcdef";
        let mpk = old::master_public_key(&secp, seed);
        let a = old::derive_pubkey(&secp, &mpk, ChangeFlag::External, 0).unwrap();
        let b = old::derive_pubkey(&secp, &mpk, ChangeFlag::External, 0).unwrap();
        assert_eq!(a, b);
        let c = old::derive_pubkey(&secp, &mpk, ChangeFlag::External, 1).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn old_account_private_key_matches_public_key() {
        let secp = Secp256k1::new();
        let seed = b"abcdefabcdefabcd";
        let mpk = old::master_public_key(&secp, seed);
        let pubkey = old::derive_pubkey(&secp, &mpk, ChangeFlag::Internal, 7).unwrap();
        let privkey = old::derive_privkey(&secp, &mpk, seed, ChangeFlag::Internal, 7).unwrap();
        assert_eq!(PublicKey::from_secret_key(&secp, &privkey), pubkey);
    }

    #[test]
    fn pubkeys_in_redeem_script_recovers_push_order() {
        let (secp, registry) = registry();
        let account = Account::TwoOfThree {
            legs: [
                Leg { prefix_index: 3, account_index: 0 },
                Leg { prefix_index: 4, account_index: 0 },
                Leg { prefix_index: 5, account_index: 0 },
            ],
            chains: AddressChains::default(),
        };
        let redeem = account.redeem_script_at(&secp, &registry, ChangeFlag::External, 0).unwrap().unwrap();
        let expected = account.leg_pubkeys(&secp, &registry, ChangeFlag::External, 0).unwrap();
        assert_eq!(pubkeys_in_redeem_script(&redeem), expected);
    }

    #[test]
    fn parse_account_id_roundtrips() {
        let legs = parse_account_id("m/3'/2 & m/4'/2 & m/5'/2").unwrap();
        assert_eq!(legs, vec![("m/3'/".to_string(), 2), ("m/4'/".to_string(), 2), ("m/5'/".to_string(), 2)]);
        assert!(parse_account_id("0").is_none());
    }
}
