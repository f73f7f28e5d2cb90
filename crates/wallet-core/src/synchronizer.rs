//! Keeps the wallet's address chains, history and transaction cache in step
//! with an external indexer. Runs on its own thread; every network wait
//! happens with no wallet lock held, per the concurrency rules in
//! spec.md §5 — state is only touched long enough to read a request or
//! apply a response.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Transaction, Txid};
use log::{debug, error, warn};

use crate::error::Error;
use crate::transactions::{status_hash, History};

/// Requests the synchronizer issues to the indexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexerRequest {
    Subscribe { address: String },
    GetHistory { address: String },
    GetTransaction { txid: Txid, height: u32 },
    Broadcast { raw_tx: Vec<u8> },
}

/// Responses the indexer hands back, tagged by the request they answer.
#[derive(Clone, Debug)]
pub enum IndexerResponse {
    Subscribed { address: String, status: Option<[u8; 32]> },
    History { address: String, entries: Vec<(Txid, u32)> },
    HistoryPruned { address: String },
    Transaction { txid: Txid, height: u32, raw: Vec<u8> },
    Broadcast { result: Result<Txid, String> },
    Error { method: String, message: String },
}

/// The indexer connection the synchronizer drives. A real implementation
/// talks Electrum-style JSON-RPC over a socket; tests substitute a
/// channel-backed fake.
pub trait IndexerClient: Send + Sync {
    fn is_connected(&self) -> bool;
    fn send(&self, requests: &[IndexerRequest]) -> Result<(), Error>;
    /// Blocks up to `timeout` for the next response, or `None` if woken by
    /// [`Synchronizer::stop`] with nothing pending.
    fn poll(&self, timeout: Duration) -> Option<IndexerResponse>;
}

/// An SPV header-chain verifier the synchronizer feeds confirmed txids
/// into; out of scope to implement here (spec.md Non-goals), but the
/// `set_verifier`-equivalent hook is preserved since account_syncer and
/// the original wallet both depend on one being pluggable.
pub trait SpvVerifier: Send + Sync {
    fn add(&self, txid: Txid, height: u32);
    fn get_height(&self, txid: &Txid) -> Option<u32>;
    /// `(confirmations, block_timestamp)` for a verified transaction;
    /// `(None, None)` if the verifier has no record of it yet.
    fn get_confirmations(&self, txid: &Txid) -> (Option<u32>, Option<u64>);
    /// Chain position used to order `get_tx_history` rows. Transactions the
    /// verifier hasn't placed yet sort after everything it has.
    fn get_txpos(&self, txid: &Txid) -> u64;
}

/// The wallet-side operations the synchronizer needs. Implemented by
/// `WalletCore` in `wallet.rs`; kept as a trait here so this module doesn't
/// need to depend on the full wallet type.
pub trait SyncTarget: Send + Sync {
    /// Extends every account's address chains up to their gap limit and
    /// returns the freshly created addresses (the legacy `synchronize()`).
    fn synchronize_addresses(&self) -> Vec<String>;
    fn get_history(&self, address: &str) -> Option<History>;
    fn receive_history_callback(&self, address: &str, history: History) -> Result<(), Error>;
    fn receive_tx_callback(&self, txid: Txid, tx: Transaction, height: u32) -> Result<(), Error>;
    fn has_transaction(&self, txid: &Txid) -> bool;
    fn is_up_to_date(&self) -> bool;
    fn set_up_to_date(&self, up_to_date: bool);
    /// Drains the addresses queued for an orphan-recovery cross-request
    /// (spec's `check_new_history`): one-off `GetHistory` lookups issued to
    /// find out whether a transaction that dropped out of its only known
    /// address's history is actually confirmed under a different address.
    fn take_pending_history_requests(&self) -> Vec<String>;
}

/// Drives one indexer connection against one wallet. `run` blocks the
/// calling thread — spawn it on its own `std::thread`.
pub struct Synchronizer<I, T, V> {
    indexer: Arc<I>,
    target: Arc<T>,
    verifier: Option<Arc<V>>,
    running: AtomicBool,
}

impl<I: IndexerClient, T: SyncTarget, V: SpvVerifier> Synchronizer<I, T, V> {
    pub fn new(indexer: Arc<I>, target: Arc<T>, verifier: Option<Arc<V>>) -> Self {
        Synchronizer { indexer, target, verifier, running: AtomicBool::new(false) }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn subscribe_to_addresses(&self, addresses: &[String]) -> Result<(), Error> {
        let requests: Vec<IndexerRequest> = addresses.iter().map(|a| IndexerRequest::Subscribe { address: a.clone() }).collect();
        if requests.is_empty() {
            return Ok(());
        }
        self.indexer.send(&requests)
    }

    /// The main synchronizer loop. Returns once `stop()` has been called and
    /// the indexer has acknowledged it (or on an unrecoverable protocol
    /// error, e.g. a status-hash mismatch from the server).
    pub fn run(&self) -> Result<(), Error> {
        self.running.store(true, Ordering::SeqCst);

        let mut missing_tx: Vec<(Txid, u32)> = Vec::new();
        let mut requested_tx: Vec<(Txid, u32)> = Vec::new();
        let mut requested_histories: HashMap<String, Option<[u8; 32]>> = HashMap::new();
        let mut was_updated = true;

        let initial_addresses = self.target.synchronize_addresses();
        self.subscribe_to_addresses(&initial_addresses)?;

        while self.is_running() {
            let new_addresses = self.target.synchronize_addresses();
            if !new_addresses.is_empty() {
                self.subscribe_to_addresses(&new_addresses)?;
            }

            let orphan_checks = self.target.take_pending_history_requests();
            if !orphan_checks.is_empty() {
                let requests: Vec<IndexerRequest> =
                    orphan_checks.into_iter().map(|address| IndexerRequest::GetHistory { address }).collect();
                self.indexer.send(&requests)?;
            }

            if !missing_tx.is_empty() {
                let requests: Vec<IndexerRequest> = missing_tx
                    .iter()
                    .filter(|entry| !requested_tx.contains(entry))
                    .map(|(txid, height)| IndexerRequest::GetTransaction { txid: *txid, height: *height })
                    .collect();
                if !requests.is_empty() {
                    self.indexer.send(&requests)?;
                    requested_tx.extend(missing_tx.drain(..));
                } else {
                    missing_tx.clear();
                }
            }

            let up_to_date = self.indexer.is_connected() && requested_tx.is_empty() && requested_histories.is_empty();
            if up_to_date != self.target.is_up_to_date() {
                self.target.set_up_to_date(up_to_date);
                was_updated = true;
            }

            let Some(response) = self.indexer.poll(Duration::from_secs(1)) else {
                continue;
            };

            match response {
                IndexerResponse::Subscribed { address, status } => {
                    let current = self.target.get_history(&address).map(|h| crate::transactions::status_of(&h));
                    let current_hash = match current {
                        Some(crate::transactions::Status::Hash(h)) => Some(h),
                        _ => None,
                    };
                    if current_hash != status && !requested_histories.contains_key(&address) {
                        self.indexer.send(&[IndexerRequest::GetHistory { address: address.clone() }])?;
                        requested_histories.insert(address, status);
                    }
                }
                IndexerResponse::HistoryPruned { address } => {
                    requested_histories.remove(&address);
                    self.target.receive_history_callback(&address, History::Pruned)?;
                }
                IndexerResponse::History { address, entries } => {
                    let announced = requested_histories.remove(&address);
                    let actual_hash = status_hash(&entries);
                    if let Some(Some(expected)) = announced {
                        if expected != actual_hash {
                            error!("synchronizer: status mismatch for {address}");
                            return Err(Error::HistoryInconsistent(address));
                        }
                    }

                    for (txid, height) in &entries {
                        if !self.target.has_transaction(txid) && !requested_tx.contains(&(*txid, *height)) && !missing_tx.contains(&(*txid, *height)) {
                            missing_tx.push((*txid, *height));
                        }
                    }

                    self.target.receive_history_callback(&address, History::Entries(entries))?;
                }
                IndexerResponse::Transaction { txid, height, raw } => {
                    requested_tx.retain(|(h, _)| h != &txid);
                    match bitcoin::consensus::deserialize::<Transaction>(&raw) {
                        Ok(tx) => {
                            self.target.receive_tx_callback(txid, tx, height)?;
                            if let Some(verifier) = &self.verifier {
                                if height > 0 {
                                    verifier.add(txid, height);
                                }
                            }
                            was_updated = true;
                        }
                        Err(e) => warn!("synchronizer: could not decode transaction {txid}: {e}"),
                    }
                }
                IndexerResponse::Broadcast { .. } => {
                    // the broadcast result is handed to the caller synchronously
                    // by the wallet core, not routed through this loop.
                }
                IndexerResponse::Error { method, message } => {
                    debug!("synchronizer: indexer error on {method}: {message}");
                }
            }

            if was_updated && requested_tx.is_empty() {
                was_updated = false;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::sync::Mutex;

    struct FakeIndexer {
        connected: AtomicBool,
        inbox: Mutex<Vec<IndexerResponse>>,
        sent: Mutex<Vec<IndexerRequest>>,
    }

    impl IndexerClient for FakeIndexer {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send(&self, requests: &[IndexerRequest]) -> Result<(), Error> {
            self.sent.lock().unwrap().extend_from_slice(requests);
            Ok(())
        }

        fn poll(&self, _timeout: Duration) -> Option<IndexerResponse> {
            self.inbox.lock().unwrap().pop()
        }
    }

    struct FakeVerifier;
    impl SpvVerifier for FakeVerifier {
        fn add(&self, _txid: Txid, _height: u32) {}
        fn get_height(&self, _txid: &Txid) -> Option<u32> {
            None
        }
        fn get_confirmations(&self, _txid: &Txid) -> (Option<u32>, Option<u64>) {
            (None, None)
        }
        fn get_txpos(&self, _txid: &Txid) -> u64 {
            u64::MAX
        }
    }

    struct FakeTarget {
        up_to_date: AtomicBool,
    }
    impl SyncTarget for FakeTarget {
        fn synchronize_addresses(&self) -> Vec<String> {
            vec![]
        }
        fn get_history(&self, _address: &str) -> Option<History> {
            None
        }
        fn receive_history_callback(&self, _address: &str, _history: History) -> Result<(), Error> {
            Ok(())
        }
        fn receive_tx_callback(&self, _txid: Txid, _tx: Transaction, _height: u32) -> Result<(), Error> {
            Ok(())
        }
        fn has_transaction(&self, _txid: &Txid) -> bool {
            false
        }
        fn is_up_to_date(&self) -> bool {
            self.up_to_date.load(Ordering::SeqCst)
        }
        fn set_up_to_date(&self, up_to_date: bool) {
            self.up_to_date.store(up_to_date, Ordering::SeqCst);
        }
        fn take_pending_history_requests(&self) -> Vec<String> {
            vec![]
        }
    }

    #[test]
    fn stop_flips_running_flag_immediately() {
        let indexer = Arc::new(FakeIndexer { connected: AtomicBool::new(true), inbox: Mutex::new(vec![]), sent: Mutex::new(vec![]) });
        let target = Arc::new(FakeTarget { up_to_date: AtomicBool::new(false) });
        let sync: Synchronizer<FakeIndexer, FakeTarget, FakeVerifier> = Synchronizer::new(indexer, target, None);
        sync.running.store(true, Ordering::SeqCst);
        sync.stop();
        assert!(!sync.is_running());
    }

    #[test]
    fn history_status_mismatch_is_rejected() {
        let entries = vec![(Txid::from_byte_array([1u8; 32]), 10)];
        let actual = status_hash(&entries);
        let claimed = status_hash(&[(Txid::from_byte_array([2u8; 32]), 0)]);
        assert_ne!(actual, claimed);
    }
}
