//! Per-address history tracking, status hashing, and the local transaction
//! cache. The sum types below replace the original's overloaded sentinels
//! (a bare `"*"` string or `['*']` list standing in for "pruned by the
//! server") with explicit variants.
use std::collections::{HashMap, HashSet};

use bitcoin::{hashes::sha256, hashes::Hash, PubkeyHash, ScriptHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// One address's known history, as reported by the indexer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum History {
    /// The indexer pruned this address's history (too many entries); the
    /// wallet must treat every locally cached tx touching it as unverifiable
    /// until fresh history arrives.
    Pruned,
    /// `(txid, height)` pairs; unconfirmed transactions use height `0`.
    Entries(Vec<(Txid, u32)>),
}

impl History {
    pub fn entries(&self) -> &[(Txid, u32)] {
        match self {
            History::Pruned => &[],
            History::Entries(entries) => entries,
        }
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        matches!(self, History::Entries(entries) if entries.iter().any(|(h, _)| h == txid))
    }
}

/// An address subscription's status, as reported by `blockchain.address.subscribe`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Server-side history was pruned.
    Pruned,
    /// Hash of the address's current history (see [`status_hash`]).
    Hash([u8; 32]),
    /// The address has no history at all.
    None,
}

/// Computes the status hash the indexer protocol expects: sha256 over the
/// concatenation of `"{txid}:{height}:"` for every history entry, in order.
/// A change in this hash is the signal to refetch an address's full history.
pub fn status_hash(history: &[(Txid, u32)]) -> [u8; 32] {
    let mut buf = String::new();
    for (txid, height) in history {
        buf.push_str(&format!("{txid}:{height}:"));
    }
    sha256::Hash::hash(buf.as_bytes()).to_byte_array()
}

pub fn status_of(history: &History) -> Status {
    match history {
        History::Pruned => Status::Pruned,
        History::Entries(entries) if entries.is_empty() => Status::None,
        History::Entries(entries) => Status::Hash(status_hash(entries)),
    }
}

/// The wallet's locally cached transactions, the per-output spend/receive
/// index derived from them, and the set of outpoints already spent by a
/// cached transaction (`transaction_lock` in spec.md §5 guards this whole
/// structure).
#[derive(Default)]
pub struct TransactionCache {
    transactions: HashMap<Txid, Transaction>,
    /// This wallet's own output values, keyed by outpoint, alongside the
    /// address that output paid, so that fee/balance math doesn't need a
    /// full UTXO round-trip to the indexer and a later spend can be
    /// attributed to the right address instead of just "some known value".
    prevout_values: HashMap<(Txid, u32), (String, u64)>,
    spent_outputs: HashSet<(Txid, u32)>,
}

impl TransactionCache {
    pub fn get(&self, txid: &Txid) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn insert(&mut self, txid: Txid, tx: Transaction) {
        self.transactions.insert(txid, tx);
    }

    pub fn remove(&mut self, txid: &Txid) -> Option<Transaction> {
        self.transactions.remove(txid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Txid, &Transaction)> {
        self.transactions.iter()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// The `(owning address, value)` this wallet recorded for `outpoint`
    /// when it first saw the transaction that created it, if any.
    pub fn prevout_owner(&self, outpoint: (Txid, u32)) -> Option<(&str, u64)> {
        self.prevout_values.get(&outpoint).map(|(addr, value)| (addr.as_str(), *value))
    }

    pub fn set_prevout_value(&mut self, outpoint: (Txid, u32), address: String, value: u64) {
        self.prevout_values.insert(outpoint, (address, value));
    }

    pub fn is_spent(&self, outpoint: &(Txid, u32)) -> bool {
        self.spent_outputs.contains(outpoint)
    }

    pub fn mark_spent(&mut self, outpoint: (Txid, u32)) {
        self.spent_outputs.insert(outpoint);
    }

    pub fn unmark_spent(&mut self, outpoint: &(Txid, u32)) {
        self.spent_outputs.remove(outpoint);
    }
}

/// Recovers the scriptPubKey an input's scriptSig spends from, for the two
/// legacy forms this wallet produces: a P2PKH scriptSig's last push is the
/// spender's pubkey, a P2SH scriptSig's last push is the redeem script.
fn scripts_revealed_by_input(script_sig: &bitcoin::Script) -> Vec<bitcoin::ScriptBuf> {
    let last_push = script_sig.instructions().filter_map(|i| i.ok()).filter_map(|i| match i {
        bitcoin::script::Instruction::PushBytes(bytes) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }).last();

    let Some(last_push) = last_push else { return Vec::new() };
    let mut candidates = Vec::new();
    if bitcoin::secp256k1::PublicKey::from_slice(&last_push).is_ok() {
        candidates.push(bitcoin::ScriptBuf::new_p2pkh(&PubkeyHash::hash(&last_push)));
    }
    candidates.push(bitcoin::ScriptBuf::new_p2sh(&ScriptHash::hash(&last_push)));
    candidates
}

/// Checks that a newly received transaction is actually referenced by the
/// wallet's known address history before accepting it into the cache: every
/// address whose history lists `tx_hash` must actually be paid by `tx` (an
/// output) or be the one spending from it (an input, revealed through its
/// scriptSig). Guards against caching transactions the server hands over
/// speculatively.
pub fn check_new_tx(history_by_script: &HashMap<bitcoin::ScriptBuf, History>, tx_hash: &Txid, tx: &Transaction) -> bool {
    let referencing: Vec<&bitcoin::ScriptBuf> = history_by_script
        .iter()
        .filter(|(_, history)| history.contains(tx_hash))
        .map(|(script, _)| script)
        .collect();

    if referencing.is_empty() {
        return false;
    }

    let input_scripts: Vec<bitcoin::ScriptBuf> = tx.input.iter().flat_map(|i| scripts_revealed_by_input(&i.script_sig)).collect();

    referencing.into_iter().all(|script| tx.output.iter().any(|o| &o.script_pubkey == script) || input_scripts.iter().any(|s| s == script))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    #[test]
    fn status_hash_is_order_sensitive() {
        let a = status_hash(&[(txid(1), 100), (txid(2), 0)]);
        let b = status_hash(&[(txid(2), 0), (txid(1), 100)]);
        assert_ne!(a, b);
    }

    #[test]
    fn status_hash_is_deterministic() {
        let entries = vec![(txid(1), 100), (txid(2), 0)];
        assert_eq!(status_hash(&entries), status_hash(&entries));
    }

    #[test]
    fn empty_history_has_none_status() {
        assert_eq!(status_of(&History::Entries(vec![])), Status::None);
    }

    #[test]
    fn pruned_history_has_pruned_status() {
        assert_eq!(status_of(&History::Pruned), Status::Pruned);
    }

    #[test]
    fn non_empty_history_has_hash_status() {
        let history = History::Entries(vec![(txid(3), 0)]);
        assert!(matches!(status_of(&history), Status::Hash(_)));
    }

    #[test]
    fn transaction_cache_tracks_spent_outpoints() {
        let mut cache = TransactionCache::default();
        let outpoint = (txid(1), 0);
        assert!(!cache.is_spent(&outpoint));
        cache.mark_spent(outpoint);
        assert!(cache.is_spent(&outpoint));
        cache.unmark_spent(&outpoint);
        assert!(!cache.is_spent(&outpoint));
    }

    #[test]
    fn history_contains_checks_txid_membership() {
        let history = History::Entries(vec![(txid(5), 10)]);
        assert!(history.contains(&txid(5)));
        assert!(!history.contains(&txid(6)));
        assert!(!History::Pruned.contains(&txid(5)));
    }

    fn dummy_tx(script_pubkeys: &[bitcoin::ScriptBuf]) -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: script_pubkeys
                .iter()
                .map(|script_pubkey| bitcoin::TxOut { value: bitcoin::Amount::from_sat(1000), script_pubkey: script_pubkey.clone() })
                .collect(),
        }
    }

    #[test]
    fn check_new_tx_rejects_unreferenced_transaction() {
        let history_by_script = HashMap::new();
        let tx = dummy_tx(&[]);
        assert!(!check_new_tx(&history_by_script, &txid(1), &tx));
    }

    #[test]
    fn check_new_tx_accepts_when_referencing_address_is_paid() {
        let script = bitcoin::ScriptBuf::from_bytes(vec![0x76, 0xa9]);
        let mut history_by_script = HashMap::new();
        history_by_script.insert(script.clone(), History::Entries(vec![(txid(1), 100)]));
        let tx = dummy_tx(&[script]);
        assert!(check_new_tx(&history_by_script, &txid(1), &tx));
    }

    #[test]
    fn check_new_tx_rejects_when_referencing_address_is_not_actually_paid() {
        let script = bitcoin::ScriptBuf::from_bytes(vec![0x76, 0xa9]);
        let other = bitcoin::ScriptBuf::from_bytes(vec![0x00, 0x14]);
        let mut history_by_script = HashMap::new();
        history_by_script.insert(script, History::Entries(vec![(txid(1), 100)]));
        let tx = dummy_tx(&[other]);
        assert!(!check_new_tx(&history_by_script, &txid(1), &tx));
    }

    #[test]
    fn check_new_tx_accepts_when_referencing_address_is_the_spending_input() {
        use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x11u8; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let script = bitcoin::ScriptBuf::new_p2pkh(&PubkeyHash::hash(&pubkey.serialize()));

        let mut history_by_script = HashMap::new();
        history_by_script.insert(script, History::Entries(vec![(txid(9), 50)]));

        let mut script_sig_bytes = vec![0x21];
        script_sig_bytes.extend_from_slice(&pubkey.serialize());
        let script_sig = bitcoin::ScriptBuf::from_bytes(script_sig_bytes);

        let tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::new(txid(2), 0),
                script_sig,
                sequence: bitcoin::Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![],
        };
        assert!(check_new_tx(&history_by_script, &txid(9), &tx));
    }
}
