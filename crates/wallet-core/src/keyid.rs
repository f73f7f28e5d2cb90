//! `KeyID` encode/decode: a compact string describing which master-key legs
//! can sign a given input, carried inside a transaction's input metadata so
//! `signrawtransaction` can figure out which local keys apply without the
//! caller needing to already know the account.
//!
//! Format: `bip32(<chain_code_hex>,<pubkey_hex>,/<account_index>/<change>/<index>)`,
//! one component per leg, joined with `&` for multisig inputs.
use bitcoin::secp256k1::PublicKey;
use wallet_common::ChangeFlag;

use crate::account::MasterKeyRegistry;
use crate::error::Error;

/// One decoded `bip32(...)` component of a `KeyID`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyIdLeg {
    pub chain_code: [u8; 32],
    pub pubkey: PublicKey,
    pub account_index: u32,
    pub change: ChangeFlag,
    pub index: u32,
}

/// Builds the `KeyID` string for an account's legs at `(account_index,
/// change, index)`. The legacy "old" account has no registry leg and is
/// represented by the literal `"old"`.
pub fn encode(legs: &[(&crate::account::MasterPublicKey, u32, ChangeFlag, u32)]) -> String {
    if legs.is_empty() {
        return "old".to_string();
    }
    legs.iter()
        .map(|(master, account_index, change, index)| {
            format!(
                "bip32({},{},/{}/{}/{})",
                hex::encode(master.chain_code),
                hex::encode(master.pubkey.serialize()),
                account_index,
                change.as_u8(),
                index,
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Parses a `KeyID` string into its component legs. Malformed components are
/// silently skipped (mirrors the original's `if not m: continue`); the
/// literal `"old"` decodes to an empty leg list.
pub fn decode(keyid: &str) -> Vec<KeyIdLeg> {
    if keyid == "old" {
        return vec![];
    }

    let mut legs = Vec::new();
    for part in keyid.split('&') {
        let Some(leg) = decode_component(part.trim()) else { continue };
        legs.push(leg);
    }
    legs
}

fn decode_component(component: &str) -> Option<KeyIdLeg> {
    let inner = component.strip_prefix("bip32(")?.strip_suffix(')')?;
    let mut fields = inner.splitn(3, ',');
    let chain_code_hex = fields.next()?;
    let pubkey_hex = fields.next()?;
    let sequence = fields.next()?;

    let chain_code_bytes = hex::decode(chain_code_hex).ok()?;
    let chain_code: [u8; 32] = chain_code_bytes.try_into().ok()?;
    let pubkey_bytes = hex::decode(pubkey_hex).ok()?;
    let pubkey = PublicKey::from_slice(&pubkey_bytes).ok()?;

    let mut parts = sequence.trim_start_matches('/').split('/');
    let account_index: u32 = parts.next()?.parse().ok()?;
    let change_raw: u8 = parts.next()?.parse().ok()?;
    let index: u32 = parts.next()?.parse().ok()?;
    let change = if change_raw == 0 { ChangeFlag::External } else { ChangeFlag::Internal };

    Some(KeyIdLeg { chain_code, pubkey, account_index, change, index })
}

/// Matches a decoded leg's `(chain_code, pubkey)` against the registry to
/// find which well-known prefix it belongs to.
pub fn find_root_by_master_key(registry: &MasterKeyRegistry, chain_code: &[u8; 32], pubkey: &PublicKey) -> Option<String> {
    registry
        .public
        .iter()
        .find(|(_, master)| &master.chain_code == chain_code && &master.pubkey == pubkey)
        .map(|(prefix, _)| prefix.clone())
}

/// Reassembles an account id string from a `KeyID`'s decoded legs, resolving
/// each leg's well-known prefix via the registry. Legs whose master key is
/// not present in the registry are dropped, permitting partial signing.
pub fn resolve_account_id(registry: &MasterKeyRegistry, legs: &[KeyIdLeg]) -> Result<Option<(String, ChangeFlag, u32)>, Error> {
    if legs.is_empty() {
        return Ok(None);
    }

    let mut roots = Vec::new();
    let mut change = None;
    let mut index = None;
    for leg in legs {
        let Some(root) = find_root_by_master_key(registry, &leg.chain_code, &leg.pubkey) else { continue };
        roots.push(format!("{root}{}", leg.account_index));
        change = Some(leg.change);
        index = Some(leg.index);
    }

    if roots.is_empty() {
        return Ok(None);
    }

    let (Some(change), Some(index)) = (change, index) else {
        return Ok(None);
    };
    Ok(Some((roots.join(" & "), change, index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MasterPublicKey;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn sample_master() -> MasterPublicKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
        MasterPublicKey { chain_code: [9u8; 32], pubkey: PublicKey::from_secret_key(&secp, &secret) }
    }

    #[test]
    fn encode_then_decode_single_leg() {
        let master = sample_master();
        let keyid = encode(&[(&master, 3, ChangeFlag::External, 5)]);
        assert!(keyid.starts_with("bip32("));

        let legs = decode(&keyid);
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].chain_code, master.chain_code);
        assert_eq!(legs[0].pubkey, master.pubkey);
        assert_eq!(legs[0].account_index, 3);
        assert_eq!(legs[0].change, ChangeFlag::External);
        assert_eq!(legs[0].index, 5);
    }

    #[test]
    fn old_account_has_literal_keyid() {
        assert_eq!(encode(&[]), "old");
        assert!(decode("old").is_empty());
    }

    #[test]
    fn malformed_component_is_skipped_not_rejected() {
        let master = sample_master();
        let keyid = encode(&[(&master, 0, ChangeFlag::External, 0)]);
        let combined = format!("{keyid}&garbage&not-a-leg");
        let legs = decode(&combined);
        assert_eq!(legs.len(), 1);
    }

    #[test]
    fn resolve_account_id_finds_known_leg_and_skips_unknown() {
        let master = sample_master();
        let mut registry = crate::account::MasterKeyRegistry::default();
        registry.public.insert("m/1'/".to_string(), master.clone());

        let keyid = encode(&[(&master, 2, ChangeFlag::Internal, 4)]);
        let legs = decode(&keyid);
        let resolved = resolve_account_id(&registry, &legs).unwrap().unwrap();
        assert_eq!(resolved.0, "m/1'/2");
        assert_eq!(resolved.1, ChangeFlag::Internal);
        assert_eq!(resolved.2, 4);
    }
}
