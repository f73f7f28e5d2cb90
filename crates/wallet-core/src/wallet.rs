//! `WalletCore`: owns the seed, accounts, address history and transaction
//! cache, and exposes the wallet's public operations. Two locks guard
//! shared state per the concurrency model: `state_lock` covers
//! `up_to_date`/`history`/address-set membership, `transaction_lock` covers
//! the transaction cache and its derived prevout/spent tables. No lock is
//! ever held across a network wait — the synchronizer only touches this
//! type through the narrow [`crate::synchronizer::SyncTarget`] surface.
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, Transaction, Txid};
use log::{info, warn};
use rand::RngCore;
use wallet_common::ChangeFlag;
use wallet_crypto::{pw_decode, pw_encode};

use crate::account::{self, Account, AddressChains, Leg, MasterKeyRegistry};
use crate::error::Error;
use crate::keyid;
use crate::storage::WalletStore;
use crate::synchronizer::{SpvVerifier, SyncTarget};
use crate::transaction_builder::{self, add_tx_change, choose_tx_inputs, ChangeAddressPolicy, InputInfo, Utxo};
use crate::transactions::{check_new_tx, History, TransactionCache};

pub const GAP_LIMIT_DEFAULT: u32 = 5;
pub const GAP_LIMIT_FOR_CHANGE: u32 = 3;
pub const SEED_VERSION: u32 = 4;
pub const MIN_SEED_VERSION: u32 = 4;
pub const IMPORTED_ACCOUNT_ID: &str = "-1";

/// One row of `get_tx_history`'s output. `txid` is `None` only for the
/// synthetic discrepancy row prepended when the running balance disagrees
/// with the account/wallet balance.
#[derive(Clone, Debug)]
pub struct TxHistoryRow {
    pub txid: Option<Txid>,
    pub confirmations: Option<u32>,
    pub is_mine: bool,
    pub value: i64,
    pub fee: Option<i64>,
    pub running_balance: i64,
    pub timestamp: Option<u64>,
}

/// Mutable, `state_lock`-guarded fields: sync status, per-address history,
/// and the frozen/prioritized membership sets.
#[derive(Default)]
struct SyncState {
    up_to_date: bool,
    history: HashMap<String, History>,
    frozen_addresses: HashSet<String>,
    prioritized_addresses: HashSet<String>,
}

/// The wallet's persisted, user-visible state that doesn't need its own
/// lock beyond the outer `Mutex<WalletInner>` — accounts, labels, contacts
/// and the master key registry all change together under one operation.
struct WalletInner {
    network: Network,
    seed_version: u32,
    seed_encrypted: String,
    use_encryption: bool,
    gap_limit: u32,
    use_change: bool,
    fee_per_kb: u64,
    registry: MasterKeyRegistry,
    accounts: HashMap<String, Account>,
    imported_keys: HashMap<String, String>,
    labels: HashMap<String, String>,
    addressbook: Vec<String>,
    next_addresses: HashMap<String, String>,
}

pub struct WalletCore {
    store: Mutex<WalletStore>,
    state: Mutex<SyncState>,
    inner: Mutex<WalletInner>,
    transactions: Mutex<TransactionCache>,
    secp: Secp256k1<bitcoin::secp256k1::All>,
    /// Orphan recovery bookkeeping (`check_new_history`): for a tx that
    /// dropped out of the one address's history it used to be attributed to,
    /// the set of that tx's own output addresses we're still waiting to hear
    /// back from before pruning it. `pending_history_requests` is the flat,
    /// dedup'd queue the synchronizer drains each iteration to issue those
    /// cross-requests.
    orphan_watch: Mutex<HashMap<Txid, HashSet<String>>>,
    pending_history_requests: Mutex<Vec<String>>,
}

impl WalletCore {
    /// Opens (or creates) the wallet file at `path` and loads every
    /// persisted field, failing `DeprecatedSeed` if the stored seed version
    /// predates BIP32 master-key support.
    pub fn open(path: impl Into<PathBuf>, network: Network) -> Result<Self, Error> {
        let store = WalletStore::open(path)?;

        let seed_version: u32 = store.get_or("seed_version", SEED_VERSION);
        if seed_version < MIN_SEED_VERSION {
            return Err(Error::DeprecatedSeed);
        }

        let registry = MasterKeyRegistry {
            public: store.get_or("master_public_keys", HashMap::new()),
            private: store.get_or("master_private_keys", HashMap::new()),
        };

        let inner = WalletInner {
            network,
            seed_version,
            seed_encrypted: store.get_or("seed", String::new()),
            use_encryption: store.get_or("use_encryption", false),
            gap_limit: store.get_or("gap_limit", GAP_LIMIT_DEFAULT),
            use_change: store.get_or("use_change", true),
            fee_per_kb: store.get_or("fee_per_kb", 20_000u64),
            registry,
            accounts: store.get_or("accounts", HashMap::new()),
            imported_keys: store.get_or("imported_keys", HashMap::new()),
            labels: store.get_or("labels", HashMap::new()),
            addressbook: store.get_or("contacts", Vec::new()),
            next_addresses: store.get_or("next_addresses", HashMap::new()),
        };

        let history: HashMap<String, History> = store.get_or("addr_history", HashMap::new());
        let frozen_addresses: HashSet<String> = store.get_or("frozen_addresses", Vec::new()).into_iter().collect();
        let prioritized_addresses: HashSet<String> = store.get_or("prioritized_addresses", Vec::new()).into_iter().collect();

        let raw_transactions: HashMap<Txid, String> = store.get_or("transactions", HashMap::new());
        let mut transactions = TransactionCache::default();
        for (txid, hex_raw) in raw_transactions {
            match hex::decode(&hex_raw).ok().and_then(|bytes| bitcoin::consensus::deserialize::<Transaction>(&bytes).ok()) {
                Some(tx) => {
                    transactions.insert(txid, tx);
                }
                None => warn!("dropping undeserializable transaction {txid} found in store"),
            }
        }

        Ok(WalletCore {
            store: Mutex::new(store),
            state: Mutex::new(SyncState { up_to_date: false, history, frozen_addresses, prioritized_addresses }),
            inner: Mutex::new(inner),
            transactions: Mutex::new(transactions),
            secp: Secp256k1::new(),
            orphan_watch: Mutex::new(HashMap::new()),
            pending_history_requests: Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("state_lock poisoned")
    }

    fn inner(&self) -> MutexGuard<'_, WalletInner> {
        self.inner.lock().expect("wallet lock poisoned")
    }

    fn txs(&self) -> MutexGuard<'_, TransactionCache> {
        self.transactions.lock().expect("transaction_lock poisoned")
    }

    fn address_for_script(&self, script_pubkey: &bitcoin::ScriptBuf, network: Network) -> Option<Address> {
        Address::from_script(script_pubkey, network).ok()
    }

    /// Persists the full set of top-level keys this wallet owns. Mirrors
    /// the legacy `WalletStorage.write()`: the whole map is rewritten every
    /// time, there is no partial update.
    fn persist(&self) -> Result<(), Error> {
        let inner = self.inner();
        let state = self.state();
        let txs = self.txs();

        let mut store = self.store.lock().expect("store lock poisoned");
        store.put_no_save("seed_version", &inner.seed_version)?;
        store.put_no_save("seed", &inner.seed_encrypted)?;
        store.put_no_save("use_encryption", &inner.use_encryption)?;
        store.put_no_save("gap_limit", &inner.gap_limit)?;
        store.put_no_save("use_change", &inner.use_change)?;
        store.put_no_save("fee_per_kb", &inner.fee_per_kb)?;
        store.put_no_save("master_public_keys", &inner.registry.public)?;
        store.put_no_save("master_private_keys", &inner.registry.private)?;
        store.put_no_save("accounts", &inner.accounts)?;
        store.put_no_save("imported_keys", &inner.imported_keys)?;
        store.put_no_save("labels", &inner.labels)?;
        store.put_no_save("contacts", &inner.addressbook)?;
        store.put_no_save("next_addresses", &inner.next_addresses)?;
        store.put_no_save("addr_history", &state.history)?;
        store.put_no_save("frozen_addresses", &state.frozen_addresses.iter().cloned().collect::<Vec<_>>())?;
        store.put_no_save("prioritized_addresses", &state.prioritized_addresses.iter().cloned().collect::<Vec<_>>())?;

        let raw_txs: HashMap<Txid, String> =
            txs.iter().map(|(txid, tx)| (*txid, hex::encode(bitcoin::consensus::serialize(tx)))).collect();
        store.put_no_save("transactions", &raw_txs)?;
        store.write()
    }

    // ---- seed lifecycle --------------------------------------------------

    /// `init_seed`: fails if a seed already exists. Generates fresh 128-bit
    /// entropy when `seed_hex` is `None`. The seed is stored unencrypted
    /// until the caller encrypts it via [`Self::update_password`].
    pub fn init_seed(&self, seed_hex: Option<String>) -> Result<String, Error> {
        let mut inner = self.inner();
        if !inner.seed_encrypted.is_empty() {
            return Err(Error::SeedAlreadyExists);
        }

        let seed_hex = seed_hex.unwrap_or_else(wallet_crypto::seed::generate_seed);
        wallet_crypto::seed::validate_roundtrip(&seed_hex)?;

        inner.seed_encrypted = pw_encode(seed_hex.as_bytes(), "");
        drop(inner);
        self.persist()?;
        Ok(seed_hex)
    }

    pub fn decode_seed(&self, passphrase: &str) -> Result<Vec<u8>, Error> {
        let inner = self.inner();
        Ok(pw_decode(&inner.seed_encrypted, passphrase)?)
    }

    /// `create_accounts`: derives all six master keypairs via BIP32 and
    /// persists them, then materializes one default single-sig account
    /// labeled "Main account".
    pub fn create_accounts(&self, passphrase: &str) -> Result<(), Error> {
        let seed = self.decode_seed(passphrase)?;
        let mut inner = self.inner();
        inner.registry = MasterKeyRegistry::from_seed(&self.secp, inner.network, &seed, passphrase)?;

        let account = Account::Single { leg: Leg { prefix_index: 0, account_index: 0 }, chains: AddressChains::default() };
        let id = account.id_string();
        inner.accounts.insert(id.clone(), account);
        inner.labels.insert(id.clone(), "Main account".to_string());
        drop(inner);

        self.extend_account_chain(&id, ChangeFlag::External, GAP_LIMIT_DEFAULT as usize)?;
        self.extend_account_chain(&id, ChangeFlag::Internal, GAP_LIMIT_FOR_CHANGE as usize)?;
        self.persist()
    }

    /// `create_watching_only_wallet`: installs the single-sig master pubkey
    /// only. No seed, no master private keys.
    pub fn create_watching_only_wallet(&self, chain_code: [u8; 32], pubkey: PublicKey) -> Result<(), Error> {
        let mut inner = self.inner();
        inner.registry.public.insert("m/0'/".to_string(), account::MasterPublicKey { chain_code, pubkey });

        let account = Account::Single { leg: Leg { prefix_index: 0, account_index: 0 }, chains: AddressChains::default() };
        let id = account.id_string();
        inner.accounts.insert(id, account);
        drop(inner);
        self.persist()
    }

    // ---- accounts ----------------------------------------------------------

    /// Finds the first account index not already used by `account_type`,
    /// checking the id format each type would produce at that index.
    fn next_free_index(&self, inner: &WalletInner, account_type: &str) -> u32 {
        let mut index = 0;
        loop {
            let candidate = match account_type {
                "1" => format!("m/0'/{index}"),
                "2of2" => format!("m/1'/{index} & m/2'/{index}"),
                "2of3" => format!("m/3'/{index} & m/4'/{index} & m/5'/{index}"),
                _ => return index,
            };
            if !inner.accounts.contains_key(&candidate) {
                return index;
            }
            index += 1;
        }
    }

    /// `create_account`: materializes the next account of `account_type`
    /// (the first index not already present in the accounts map).
    pub fn create_account(&self, account_type: &str) -> Result<String, Error> {
        let mut inner = self.inner();
        let index = match account_type {
            "1" | "2of2" | "2of3" => self.next_free_index(&inner, account_type),
            other => return Err(Error::InvalidAccountType(other.to_string())),
        };

        let account = match account_type {
            "1" => Account::Single { leg: Leg { prefix_index: 0, account_index: index }, chains: AddressChains::default() },
            "2of2" => Account::TwoOfTwo {
                legs: [Leg { prefix_index: 1, account_index: index }, Leg { prefix_index: 2, account_index: index }],
                chains: AddressChains::default(),
            },
            "2of3" => Account::TwoOfThree {
                legs: [
                    Leg { prefix_index: 3, account_index: index },
                    Leg { prefix_index: 4, account_index: index },
                    Leg { prefix_index: 5, account_index: index },
                ],
                chains: AddressChains::default(),
            },
            other => return Err(Error::InvalidAccountType(other.to_string())),
        };
        let id = account.id_string();
        inner.accounts.insert(id.clone(), account);
        inner.next_addresses.remove(&format!("{account_type}:{index}"));
        drop(inner);

        self.extend_account_chain(&id, ChangeFlag::External, 1)?;
        self.persist()?;
        Ok(id)
    }

    /// `import_key`: verifies `passphrase` decodes the seed, parses the WIF
    /// to derive an address, rejects an address already in the wallet, and
    /// stores the WIF encrypted under the imported-keys map.
    pub fn import_key(&self, wif: &str, passphrase: &str) -> Result<String, Error> {
        self.decode_seed(passphrase)?;
        let privkey = PrivateKey::from_wif(wif).map_err(|_| Error::InvalidPrivateKey)?;
        let pubkey = privkey.public_key(&self.secp);
        let address = Address::p2pkh(pubkey.pubkey_hash(), privkey.network).to_string();

        let mut inner = self.inner();
        if inner.imported_keys.contains_key(&address) || self.is_mine_locked(&inner, &address) {
            return Err(Error::AddressAlreadyPresent(address));
        }
        inner.imported_keys.insert(address.clone(), pw_encode(wif.as_bytes(), passphrase));
        drop(inner);
        self.persist()?;
        Ok(address)
    }

    fn is_mine_locked(&self, inner: &WalletInner, address: &str) -> bool {
        inner.accounts.values().any(|a| a.chains().external.iter().any(|x| x == address) || a.chains().internal.iter().any(|x| x == address))
    }

    /// `addresses`: imported addresses first (placeholder account id `-1`),
    /// then each account's external chain, then its change chain if
    /// `include_change`, then any pending `next_addresses`.
    pub fn addresses(&self, include_change: bool, include_next: bool) -> Vec<String> {
        let inner = self.inner();
        let mut out: Vec<String> = inner.imported_keys.keys().cloned().collect();
        for account in inner.accounts.values() {
            out.extend(account.chains().external.iter().cloned());
            if include_change {
                out.extend(account.chains().internal.iter().cloned());
            }
        }
        if include_next {
            out.extend(inner.next_addresses.values().cloned());
        }
        out
    }

    pub fn is_mine(&self, address: &str) -> bool {
        let inner = self.inner();
        inner.imported_keys.contains_key(address) || self.is_mine_locked(&inner, address)
    }

    pub fn is_change(&self, address: &str) -> bool {
        let inner = self.inner();
        inner.accounts.values().any(|a| a.chains().internal.iter().any(|x| x == address))
    }

    /// `get_address_index`: `(-1, None)` for imported addresses;
    /// `AddressNotFound` otherwise.
    pub fn get_address_index(&self, address: &str) -> Result<(String, Option<(ChangeFlag, u32)>), Error> {
        let inner = self.inner();
        if inner.imported_keys.contains_key(address) {
            return Ok((IMPORTED_ACCOUNT_ID.to_string(), None));
        }
        for (id, account) in inner.accounts.iter() {
            for (change, chain) in [(ChangeFlag::External, &account.chains().external), (ChangeFlag::Internal, &account.chains().internal)] {
                if let Some(index) = chain.iter().position(|a| a == address) {
                    return Ok((id.clone(), Some((change, index as u32))));
                }
            }
        }
        Err(Error::AddressNotFound(address.to_string()))
    }

    /// `get_private_key`: WIF(s) needed to sign on behalf of `address`.
    pub fn get_private_key(&self, address: &str, passphrase: &str) -> Result<Vec<PrivateKey>, Error> {
        let inner = self.inner();
        if let Some(encrypted) = inner.imported_keys.get(address) {
            let wif = pw_decode(encrypted, passphrase).map_err(|_| Error::InvalidPassword)?;
            let wif = String::from_utf8(wif).map_err(|_| Error::InvalidPrivateKey)?;
            return Ok(vec![PrivateKey::from_wif(&wif).map_err(|_| Error::InvalidPrivateKey)?]);
        }
        drop(inner);

        let (account_id, sequence) = self.get_address_index(address)?;
        let Some((change, index)) = sequence else { return Err(Error::AddressNotFound(address.to_string())) };

        let inner = self.inner();
        let account = inner.accounts.get(&account_id).ok_or(Error::AccountNotFound(account_id.clone()))?;
        let seed = if matches!(account, Account::Old { .. }) { Some(self.decode_seed(passphrase)?) } else { None };
        account.private_keys_at(&self.secp, &inner.registry, inner.network, change, index, seed.as_deref(), passphrase)
    }

    // ---- address-chain extension / gap limit --------------------------------

    fn extend_account_chain(&self, account_id: &str, change: ChangeFlag, minimum: usize) -> Result<Vec<String>, Error> {
        let mut inner = self.inner();
        let network = inner.network;
        let registry = inner.registry.clone();
        let account = inner.accounts.get_mut(account_id).ok_or(Error::AccountNotFound(account_id.to_string()))?;

        let mut created = Vec::new();
        while account.chains().chain(change).len() < minimum {
            created.push(account.create_new_address(&self.secp, &registry, network, change)?);
        }
        Ok(created)
    }

    fn tail_is_all_unused(&self, account: &Account, change: ChangeFlag, limit: usize) -> bool {
        let state = self.state();
        let chain = account.chains().chain(change);
        if chain.len() < limit {
            return false;
        }
        chain[chain.len() - limit..].iter().all(|addr| !self.address_is_old(&state, addr))
    }

    fn address_is_old(&self, state: &SyncState, address: &str) -> bool {
        match state.history.get(address) {
            None => false,
            Some(History::Pruned) => true,
            Some(History::Entries(entries)) => !entries.is_empty(),
        }
    }

    /// `new_account_address`: the address the next not-yet-materialized
    /// account of `account_type` would use as its first external address,
    /// derived straight from the master public keys — no account object is
    /// created yet. Cached in `next_addresses` until the account actually
    /// materializes. Returns `None` if the required master public key(s)
    /// aren't registered yet (e.g. before `create_accounts`).
    fn new_account_address(&self, account_type: &str) -> Result<Option<String>, Error> {
        let mut inner = self.inner();
        let index = self.next_free_index(&inner, account_type);
        let key = format!("{account_type}:{index}");

        if let Some(addr) = inner.next_addresses.get(&key) {
            return Ok(Some(addr.clone()));
        }

        let prefixes: &[u8] = match account_type {
            "1" => &[0],
            "2of2" => &[1, 2],
            "2of3" => &[3, 4, 5],
            _ => return Ok(None),
        };
        if prefixes.iter().any(|p| !inner.registry.public.contains_key(account::MASTER_KEY_PREFIXES[*p as usize])) {
            return Ok(None);
        }

        let account = match account_type {
            "1" => Account::Single { leg: Leg { prefix_index: 0, account_index: index }, chains: AddressChains::default() },
            "2of2" => Account::TwoOfTwo {
                legs: [Leg { prefix_index: 1, account_index: index }, Leg { prefix_index: 2, account_index: index }],
                chains: AddressChains::default(),
            },
            "2of3" => Account::TwoOfThree {
                legs: [
                    Leg { prefix_index: 3, account_index: index },
                    Leg { prefix_index: 4, account_index: index },
                    Leg { prefix_index: 5, account_index: index },
                ],
                chains: AddressChains::default(),
            },
            _ => return Ok(None),
        };
        let addr = account.first_address(&self.secp, &inner.registry, inner.network)?;
        inner.next_addresses.insert(key, addr.clone());
        drop(inner);
        self.persist()?;
        Ok(Some(addr))
    }

    /// `create_pending_accounts`: for each account type, materializes the
    /// next account once its would-be first address already has history —
    /// the lazy account-discovery mechanism that lets a restored wallet pick
    /// up multisig/second-single-sig accounts it never explicitly created.
    pub fn create_pending_accounts(&self) -> Result<(), Error> {
        for account_type in ["1", "2of2", "2of3"] {
            let Some(candidate) = self.new_account_address(account_type)? else { continue };
            let is_old = {
                let state = self.state();
                self.address_is_old(&state, &candidate)
            };
            if is_old {
                self.create_account(account_type)?;
            }
        }
        Ok(())
    }

    /// `synchronize()`: for every account and change flag, extends the
    /// address chain until the gap limit of trailing addresses are all
    /// unused. Returns every newly created address so the caller can
    /// subscribe to them.
    pub fn synchronize(&self) -> Result<Vec<String>, Error> {
        self.create_pending_accounts()?;
        let account_ids: Vec<String> = self.inner().accounts.keys().cloned().collect();
        let mut new_addresses = Vec::new();

        for id in account_ids {
            for (change, limit) in [(ChangeFlag::External, self.inner().gap_limit as usize), (ChangeFlag::Internal, GAP_LIMIT_FOR_CHANGE as usize)] {
                loop {
                    let account = {
                        let inner = self.inner();
                        inner.accounts.get(&id).cloned().ok_or(Error::AccountNotFound(id.clone()))?
                    };
                    if self.tail_is_all_unused(&account, change, limit) {
                        break;
                    }
                    let mut inner = self.inner();
                    let network = inner.network;
                    let registry = inner.registry.clone();
                    let account_mut = inner.accounts.get_mut(&id).ok_or(Error::AccountNotFound(id.clone()))?;
                    let addr = account_mut.create_new_address(&self.secp, &registry, network, change)?;
                    drop(inner);
                    self.state().history.entry(addr.clone()).or_insert(History::Entries(vec![]));
                    new_addresses.push(addr);
                }
            }
        }
        Ok(new_addresses)
    }

    /// `change_gap_limit`: accepted only if `v >= gap_limit` or
    /// `v >= min_acceptable_gap()`. Trims trailing unused addresses when
    /// decreasing.
    pub fn change_gap_limit(&self, new_limit: u32) -> Result<(), Error> {
        let min_acceptable = self.min_acceptable_gap();
        {
            let inner = self.inner();
            if new_limit < inner.gap_limit && new_limit < min_acceptable {
                return Err(Error::InvalidDerivationIndex);
            }
        }
        let mut inner = self.inner();
        let old_limit = inner.gap_limit;
        inner.gap_limit = new_limit;
        if new_limit < old_limit {
            for account in inner.accounts.values_mut() {
                let chain = &mut account.chains_mut().external;
                while chain.len() as u32 > new_limit {
                    chain.pop();
                }
            }
        }
        drop(inner);
        self.persist()
    }

    fn min_acceptable_gap(&self) -> u32 {
        let inner = self.inner();
        let state = self.state();
        let mut longest_run = 0u32;
        for account in inner.accounts.values() {
            let mut run = 0u32;
            for addr in &account.chains().external {
                if self.address_is_old(&state, addr) {
                    run = 0;
                } else {
                    run += 1;
                    longest_run = longest_run.max(run);
                }
            }
        }
        longest_run + 1
    }

    // ---- labels / contacts / misc -----------------------------------------

    pub fn set_label(&self, key: &str, label: &str) -> Result<(), Error> {
        self.inner().labels.insert(key.to_string(), label.to_string());
        self.persist()
    }

    pub fn get_label(&self, key: &str) -> Option<String> {
        self.inner().labels.get(key).cloned()
    }

    pub fn get_default_label(&self, txid: &Txid) -> String {
        self.get_label(&txid.to_string()).unwrap_or_default()
    }

    pub fn add_contact(&self, address: &str) -> Result<(), Error> {
        let mut inner = self.inner();
        if !inner.addressbook.iter().any(|a| a == address) {
            inner.addressbook.push(address.to_string());
        }
        drop(inner);
        self.persist()
    }

    pub fn delete_contact(&self, address: &str) -> Result<(), Error> {
        self.inner().addressbook.retain(|a| a != address);
        self.persist()
    }

    pub fn set_fee(&self, fee_per_kb: u64) -> Result<(), Error> {
        let mut inner = self.inner();
        if inner.fee_per_kb != fee_per_kb {
            inner.fee_per_kb = fee_per_kb;
            drop(inner);
            self.persist()?;
        }
        Ok(())
    }

    pub fn get_account_name(&self, account_id: &str) -> Option<String> {
        self.get_label(account_id)
    }

    pub fn get_account_names(&self) -> HashMap<String, String> {
        let inner = self.inner();
        inner.accounts.keys().map(|id| (id.clone(), self.get_label(id).unwrap_or_else(|| id.clone()))).collect()
    }

    pub fn delete_imported_key(&self, address: &str) -> Result<(), Error> {
        let mut inner = self.inner();
        if inner.imported_keys.remove(address).is_none() {
            return Err(Error::AddressNotFound(address.to_string()));
        }
        drop(inner);
        self.persist()
    }

    pub fn get_address_flags(&self, address: &str) -> (bool, bool) {
        let state = self.state();
        (state.frozen_addresses.contains(address), state.prioritized_addresses.contains(address))
    }

    pub fn fill_addressbook(&self) -> Vec<String> {
        self.inner().addressbook.clone()
    }

    // ---- freeze / prioritize: disjoint sets --------------------------------

    fn mutate_address_set(&self, address: &str, add_to_frozen: bool, insert: bool) -> bool {
        if !self.is_mine(address) {
            return false;
        }
        let mut state = self.state();
        if add_to_frozen {
            if insert {
                state.prioritized_addresses.remove(address);
                state.frozen_addresses.insert(address.to_string())
            } else {
                state.frozen_addresses.remove(address)
            }
        } else if insert {
            state.frozen_addresses.remove(address);
            state.prioritized_addresses.insert(address.to_string())
        } else {
            state.prioritized_addresses.remove(address)
        }
    }

    pub fn freeze(&self, address: &str) -> bool {
        self.mutate_address_set(address, true, true)
    }

    pub fn unfreeze(&self, address: &str) -> bool {
        self.mutate_address_set(address, true, false)
    }

    pub fn prioritize(&self, address: &str) -> bool {
        self.mutate_address_set(address, false, true)
    }

    pub fn unprioritize(&self, address: &str) -> bool {
        self.mutate_address_set(address, false, false)
    }

    // ---- password -----------------------------------------------------------

    /// `update_password`: re-encrypts the seed, all imported keys, and all
    /// master private keys under `new_passphrase`.
    pub fn update_password(&self, old_passphrase: &str, new_passphrase: &str) -> Result<(), Error> {
        let seed = self.decode_seed(old_passphrase)?;
        let mut inner = self.inner();

        inner.seed_encrypted = pw_encode(&seed, new_passphrase);

        let reencrypted_imports: Result<HashMap<String, String>, Error> = inner
            .imported_keys
            .iter()
            .map(|(addr, encrypted)| {
                let plaintext = pw_decode(encrypted, old_passphrase).map_err(|_| Error::InvalidPassword)?;
                Ok((addr.clone(), pw_encode(&plaintext, new_passphrase)))
            })
            .collect();
        inner.imported_keys = reencrypted_imports?;

        let reencrypted_master: Result<HashMap<String, String>, Error> = inner
            .registry
            .private
            .iter()
            .map(|(prefix, encrypted)| {
                let plaintext = pw_decode(encrypted, old_passphrase).map_err(|_| Error::InvalidPassword)?;
                Ok((prefix.clone(), pw_encode(&plaintext, new_passphrase)))
            })
            .collect();
        inner.registry.private = reencrypted_master?;

        inner.use_encryption = !new_passphrase.is_empty();
        drop(inner);
        self.persist()
    }

    // ---- balances -------------------------------------------------------------

    /// `get_addr_balance`: sums outputs paying to `addr` and subtracts
    /// inputs that spend a previously-received coin at `addr`, splitting by
    /// confirmation status. A pruned history yields `(0, 0)`.
    pub fn get_addr_balance(&self, address: &str) -> (i64, i64) {
        let state = self.state();
        let Some(history) = state.history.get(address) else { return (0, 0) };
        let History::Entries(entries) = history else { return (0, 0) };

        let network = self.inner().network;
        let txs = self.txs();
        let mut confirmed = 0i64;
        let mut unconfirmed = 0i64;

        for (txid, height) in entries {
            let Some(tx) = txs.get(txid) else { continue };
            let mut delta: i64 = 0;
            for output in &tx.output {
                if let Some(addr) = self.address_for_script(&output.script_pubkey, network) {
                    if addr.to_string() == address {
                        delta += output.value.to_sat() as i64;
                    }
                }
            }
            for input in &tx.input {
                let outpoint = (input.previous_output.txid, input.previous_output.vout);
                if let Some((owner, value)) = txs.prevout_owner(outpoint) {
                    if owner == address {
                        delta -= value as i64;
                    }
                }
            }
            if *height > 0 {
                confirmed += delta;
            } else {
                unconfirmed += delta;
            }
        }
        (confirmed, unconfirmed)
    }

    pub fn get_account_balance(&self, account_id: &str) -> (i64, i64) {
        let inner = self.inner();
        let Some(account) = inner.accounts.get(account_id) else { return (0, 0) };
        let mut confirmed = 0i64;
        let mut unconfirmed = 0i64;
        for addr in account.chains().external.iter().chain(account.chains().internal.iter()) {
            let (c, u) = self.get_addr_balance(addr);
            confirmed += c;
            unconfirmed += u;
        }
        (confirmed, unconfirmed)
    }

    pub fn get_imported_balance(&self) -> (i64, i64) {
        let inner = self.inner();
        let mut confirmed = 0i64;
        let mut unconfirmed = 0i64;
        for addr in inner.imported_keys.keys() {
            let (c, u) = self.get_addr_balance(addr);
            confirmed += c;
            unconfirmed += u;
        }
        (confirmed, unconfirmed)
    }

    pub fn get_balance(&self) -> (i64, i64) {
        let account_ids: Vec<String> = self.inner().accounts.keys().cloned().collect();
        let (mut confirmed, mut unconfirmed) = self.get_imported_balance();
        for id in account_ids {
            let (c, u) = self.get_account_balance(&id);
            confirmed += c;
            unconfirmed += u;
        }
        (confirmed, unconfirmed)
    }

    /// `get_tx_history`: every transaction touching `account_id`'s domain
    /// (the whole wallet if `None`), ordered by `verifier`'s chain position,
    /// each row carrying its net value to the domain, fee (computable only
    /// when every one of its inputs' prevout values are locally known), and
    /// a running balance. If the running balance disagrees with
    /// `get_account_balance`/`get_balance`, a synthetic row carrying the
    /// discrepancy is prepended and folded into every later running balance,
    /// so the final total always matches the reported balance.
    pub fn get_tx_history<V: SpvVerifier>(&self, account_id: Option<&str>, verifier: &V) -> Vec<TxHistoryRow> {
        let domain: HashSet<String> = self.account_domain(account_id).into_iter().collect();
        let network = self.inner().network;
        let txs = self.txs();

        let mut txids: Vec<Txid> = txs.iter().map(|(txid, _)| *txid).collect();
        txids.sort_by_key(|txid| verifier.get_txpos(txid));

        struct Computed {
            txid: Txid,
            is_relevant: bool,
            is_mine: bool,
            value: i64,
            fee: Option<i64>,
        }

        let mut computed = Vec::new();
        let mut naive_balance = 0i64;
        for txid in &txids {
            let Some(tx) = txs.get(txid) else { continue };

            let mut value = 0i64;
            let mut is_mine = false;
            let mut all_inputs_known = true;
            let mut total_in = 0i64;
            for input in &tx.input {
                let outpoint = (input.previous_output.txid, input.previous_output.vout);
                match txs.prevout_owner(outpoint) {
                    Some((owner, amount)) => {
                        total_in += amount as i64;
                        if domain.contains(owner) {
                            is_mine = true;
                            value -= amount as i64;
                        }
                    }
                    None => all_inputs_known = false,
                }
            }

            let mut total_out = 0i64;
            for output in &tx.output {
                total_out += output.value.to_sat() as i64;
                if let Some(addr) = self.address_for_script(&output.script_pubkey, network) {
                    if domain.contains(&addr.to_string()) {
                        value += output.value.to_sat() as i64;
                    }
                }
            }

            let is_relevant = is_mine || value != 0;
            let fee = if is_mine && all_inputs_known { Some(total_in - total_out) } else { None };
            if is_relevant {
                naive_balance += value;
            }
            computed.push(Computed { txid: *txid, is_relevant, is_mine, value, fee });
        }
        drop(txs);

        let (confirmed, unconfirmed) = match account_id {
            Some(id) => self.get_account_balance(id),
            None => self.get_balance(),
        };
        let expected = confirmed + unconfirmed;

        let mut rows = Vec::new();
        let mut running = 0i64;
        if naive_balance != expected {
            let discrepancy = expected - naive_balance;
            running = discrepancy;
            rows.push(TxHistoryRow {
                txid: None,
                confirmations: Some(1000),
                is_mine: false,
                value: discrepancy,
                fee: None,
                running_balance: running,
                timestamp: None,
            });
        }

        for c in computed {
            if !c.is_relevant {
                continue;
            }
            running += c.value;
            let (confirmations, timestamp) = verifier.get_confirmations(&c.txid);
            rows.push(TxHistoryRow {
                txid: Some(c.txid),
                confirmations,
                is_mine: c.is_mine,
                value: c.value,
                fee: c.fee,
                running_balance: running,
                timestamp,
            });
        }
        rows
    }

    // ---- coin selection / transaction assembly --------------------------------

    fn unspent_coins(&self, addresses: &[String]) -> Vec<Utxo> {
        let network = self.inner().network;
        let state = self.state();
        let txs = self.txs();
        let mut coins = Vec::new();
        for addr in addresses {
            let Some(History::Entries(entries)) = state.history.get(addr) else { continue };
            for (txid, _height) in entries {
                let Some(tx) = txs.get(txid) else { continue };
                for (vout, output) in tx.output.iter().enumerate() {
                    let outpoint = (*txid, vout as u32);
                    if txs.is_spent(&outpoint) {
                        continue;
                    }
                    if let Some(out_addr) = self.address_for_script(&output.script_pubkey, network) {
                        if &out_addr.to_string() == addr {
                            coins.push(Utxo { outpoint: bitcoin::OutPoint::new(*txid, vout as u32), address: addr.clone(), value: output.value });
                        }
                    }
                }
            }
        }
        coins
    }

    fn account_domain(&self, account_id: Option<&str>) -> Vec<String> {
        let inner = self.inner();
        match account_id {
            Some(id) => inner
                .accounts
                .get(id)
                .map(|a| a.chains().external.iter().chain(a.chains().internal.iter()).cloned().collect())
                .unwrap_or_default(),
            None => self.addresses(true, false),
        }
    }

    /// `make_unsigned_transaction`: runs coin selection and change
    /// placement over `outputs`, returning the assembled (inputs, outputs).
    pub fn make_unsigned_transaction(
        &self,
        outputs: Vec<(String, bitcoin::Amount)>,
        fixed_fee: Option<bitcoin::Amount>,
        change_address: Option<String>,
        account_id: Option<&str>,
    ) -> Result<(Vec<Utxo>, Vec<(String, bitcoin::Amount)>), Error> {
        for (addr, _) in &outputs {
            Address::from_str(addr).map_err(|_| Error::InvalidAddress(addr.clone()))?;
        }
        let amount: bitcoin::Amount = outputs.iter().fold(bitcoin::Amount::ZERO, |acc, (_, v)| acc + *v);

        let domain = self.account_domain(account_id);
        let (state_frozen, state_prioritized) = {
            let state = self.state();
            (state.frozen_addresses.clone(), state.prioritized_addresses.clone())
        };
        let all_coins = self.unspent_coins(&domain);
        let (prioritized, ordinary) = transaction_builder::partition_spendable(all_coins, &state_frozen, &state_prioritized);

        let fee_per_kb = bitcoin::Amount::from_sat(self.inner().fee_per_kb);
        let selected = choose_tx_inputs(amount, fixed_fee, fee_per_kb, &prioritized, &ordinary).ok_or(Error::InsufficientFunds)?;

        let use_change = self.inner().use_change;
        let policy = if let Some(addr) = &change_address {
            ChangeAddressPolicy::Explicit(addr)
        } else if !use_change || account_id.is_none() {
            ChangeAddressPolicy::LastInputAddress
        } else {
            return self.make_unsigned_with_account_change(selected, outputs, amount, account_id.unwrap());
        };

        let mut out_list = outputs;
        if let Some((addr, amt, pos)) = add_tx_change(&selected.inputs, out_list.len(), amount, selected.fee, selected.total, policy)? {
            out_list.insert(pos.min(out_list.len()), (addr, amt));
        }
        Ok((selected.inputs, out_list))
    }

    fn make_unsigned_with_account_change(
        &self,
        selected: transaction_builder::SelectedInputs,
        mut out_list: Vec<(String, bitcoin::Amount)>,
        amount: bitcoin::Amount,
        account_id: &str,
    ) -> Result<(Vec<Utxo>, Vec<(String, bitcoin::Amount)>), Error> {
        let inner = self.inner();
        let account = inner.accounts.get(account_id).ok_or(Error::AccountNotFound(account_id.to_string()))?;
        let change_chain = &account.chains().internal;
        let idx = change_chain.len().checked_sub(GAP_LIMIT_FOR_CHANGE as usize).ok_or(Error::AddressNotFound(account_id.to_string()))?;
        let change_addr = change_chain[idx].clone();
        drop(inner);

        if let Some((addr, amt, pos)) =
            add_tx_change(&selected.inputs, out_list.len(), amount, selected.fee, selected.total, ChangeAddressPolicy::AccountChangeAddress(&change_addr))?
        {
            out_list.insert(pos.min(out_list.len()), (addr, amt));
        }
        Ok((selected.inputs, out_list))
    }

    /// `signrawtransaction`: resolves each input's prevout via
    /// `input_info` or the wallet's known UTXO set, decodes any `KeyID`, and
    /// collects every locally derivable private key. Inputs with neither
    /// source fail `UnknownInput`.
    pub fn signrawtransaction(&self, tx: &Transaction, input_info: &[InputInfo], passphrase: &str) -> Result<HashMap<PublicKey, PrivateKey>, Error> {
        let mut keys = HashMap::new();
        let txs = self.txs();
        let inner = self.inner();

        for input in &tx.input {
            let prevout = (input.previous_output.txid, input.previous_output.vout);
            let info = input_info.iter().find(|i| i.txid == prevout.0 && i.vout == prevout.1);

            let key_id = match info {
                Some(info) => info.key_id.clone(),
                None => {
                    if !txs.contains(&prevout.0) {
                        return Err(Error::UnknownInput);
                    }
                    None
                }
            };

            let Some(key_id) = key_id else { continue };
            let legs = keyid::decode(&key_id);
            let Some((account_id, change, index)) = keyid::resolve_account_id(&inner.registry, &legs)? else { continue };
            let Some(account) = inner.accounts.get(&account_id) else { continue };
            let seed = if matches!(account, Account::Old { .. }) { Some(self.decode_seed(passphrase)?) } else { None };
            for pk in account.private_keys_at(&self.secp, &inner.registry, inner.network, change, index, seed.as_deref(), passphrase)? {
                keys.insert(pk.public_key(&self.secp).inner, pk);
            }
        }
        Ok(keys)
    }

    /// Resolves the scriptPubKey and owning address of the coin `outpoint`
    /// spends, preferring an externally supplied `input_info` entry (for
    /// inputs the wallet doesn't itself control) over its own tx cache.
    fn resolve_input_address(&self, outpoint: &bitcoin::OutPoint, input_info: &[InputInfo]) -> Result<(String, bitcoin::ScriptBuf), Error> {
        if let Some(info) = input_info.iter().find(|i| i.txid == outpoint.txid && i.vout == outpoint.vout) {
            let network = self.inner().network;
            let address = self.address_for_script(&info.script_pubkey, network).ok_or(Error::UnknownInput)?;
            return Ok((address.to_string(), info.script_pubkey.clone()));
        }
        let network = self.inner().network;
        let txs = self.txs();
        let prev_tx = txs.get(&outpoint.txid).ok_or(Error::UnknownInput)?;
        let output = prev_tx.output.get(outpoint.vout as usize).ok_or(Error::UnknownInput)?;
        let address = self.address_for_script(&output.script_pubkey, network).ok_or(Error::UnknownInput)?;
        Ok((address.to_string(), output.script_pubkey.clone()))
    }

    /// The redeem script to sign against for `address`, or `None` for
    /// imported/single-sig/old addresses whose scriptSig is a bare P2PKH
    /// push.
    fn redeem_script_for_address(&self, address: &str) -> Result<Option<bitcoin::ScriptBuf>, Error> {
        {
            let inner = self.inner();
            if inner.imported_keys.contains_key(address) {
                return Ok(None);
            }
        }
        let (account_id, sequence) = self.get_address_index(address)?;
        let Some((change, index)) = sequence else { return Ok(None) };
        let inner = self.inner();
        let account = inner.accounts.get(&account_id).ok_or(Error::AccountNotFound(account_id.clone()))?;
        account.redeem_script_at(&self.secp, &inner.registry, change, index)
    }

    /// `sign_transaction`: for each input, resolves the address it spends
    /// from, computes the legacy sighash over its redeem script (P2SH
    /// multisig) or scriptPubKey (P2PKH), signs with every private key
    /// `passphrase` unlocks for that address, and assembles the scriptSig.
    /// Multisig inputs are signed partially when only some legs' keys are
    /// locally available; combining signatures from other co-signers into a
    /// complete scriptSig is left to the caller.
    pub fn sign_transaction(&self, mut tx: Transaction, input_info: &[InputInfo], passphrase: &str) -> Result<Transaction, Error> {
        use bitcoin::hashes::Hash;
        use bitcoin::script::{Builder, PushBytesBuf};
        use bitcoin::secp256k1::Message;
        use bitcoin::sighash::{EcdsaSighashType, SighashCache};

        let unsigned = tx.clone();
        for index in 0..tx.input.len() {
            let outpoint = unsigned.input[index].previous_output;
            let (address, script_pubkey) = self.resolve_input_address(&outpoint, input_info)?;
            let redeem_script = self.redeem_script_for_address(&address)?;
            let sighash_script = redeem_script.as_ref().unwrap_or(&script_pubkey);

            let mut cache = SighashCache::new(&unsigned);
            let sighash = cache
                .legacy_signature_hash(index, sighash_script, EcdsaSighashType::All.to_u32())
                .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());

            let private_keys = self.get_private_key(&address, passphrase)?;

            let script_sig = if let Some(redeem) = &redeem_script {
                let mut builder = Builder::new().push_int(0);
                let mut signed_any = false;
                for pubkey in account::pubkeys_in_redeem_script(redeem) {
                    let Some(privkey) = private_keys.iter().find(|pk| pk.public_key(&self.secp).inner == pubkey) else { continue };
                    let signature = self.secp.sign_ecdsa(&message, &privkey.inner);
                    let mut sig_bytes = signature.serialize_der().to_vec();
                    sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
                    let mut push = PushBytesBuf::new();
                    push.extend_from_slice(&sig_bytes).expect("DER signature fits a push");
                    builder = builder.push_slice(push);
                    signed_any = true;
                }
                if !signed_any {
                    return Err(Error::UnknownInput);
                }
                let mut redeem_push = PushBytesBuf::new();
                redeem_push.extend_from_slice(redeem.as_bytes()).expect("redeem script fits a push");
                builder.push_slice(redeem_push).into_script()
            } else {
                let privkey = private_keys.first().ok_or(Error::UnknownInput)?;
                let pubkey = privkey.public_key(&self.secp).inner;
                let signature = self.secp.sign_ecdsa(&message, &privkey.inner);
                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
                let mut sig_push = PushBytesBuf::new();
                sig_push.extend_from_slice(&sig_bytes).expect("DER signature fits a push");
                let mut pk_push = PushBytesBuf::new();
                pk_push.extend_from_slice(&pubkey.serialize()).expect("33 bytes fits a push");
                Builder::new().push_slice(sig_push).push_slice(pk_push).into_script()
            };

            tx.input[index].script_sig = script_sig;
        }

        Ok(tx)
    }

    /// `mktx`: runs coin selection (`make_unsigned_transaction`), assembles
    /// the unsigned transaction, and signs every input with keys this
    /// wallet controls. Every selected input is necessarily one of this
    /// wallet's own coins, so no `input_info` is needed for signing.
    pub fn mktx(
        &self,
        outputs: Vec<(String, bitcoin::Amount)>,
        passphrase: &str,
        fixed_fee: Option<bitcoin::Amount>,
        change_address: Option<String>,
        account_id: Option<&str>,
    ) -> Result<Transaction, Error> {
        let (inputs, out_list) = self.make_unsigned_transaction(outputs, fixed_fee, change_address, account_id)?;
        let network = self.inner().network;

        let tx_inputs: Vec<bitcoin::TxIn> = inputs
            .iter()
            .map(|u| bitcoin::TxIn {
                previous_output: u.outpoint,
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: bitcoin::Sequence::MAX,
                witness: bitcoin::Witness::new(),
            })
            .collect();
        let tx_outputs: Vec<bitcoin::TxOut> = out_list
            .into_iter()
            .map(|(addr, amount)| -> Result<bitcoin::TxOut, Error> {
                let address = Address::from_str(&addr).map_err(|_| Error::InvalidAddress(addr.clone()))?;
                let address = address.require_network(network).map_err(|_| Error::InvalidAddress(addr.clone()))?;
                Ok(bitcoin::TxOut { value: amount, script_pubkey: address.script_pubkey() })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let unsigned = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };
        self.sign_transaction(unsigned, &[], passphrase)
    }

    /// `check_new_history`'s orphan side: `address`'s history just changed
    /// from `previous`. Any tx that used to be attributed to `address` alone
    /// and isn't in the new history gets queued for an external lookup of
    /// its own output addresses — if none of them report it, it's pruned
    /// (see `receive_history_callback`, which resolves the watch entries
    /// this creates).
    fn detect_orphans(&self, address: &str, previous: Option<&History>) {
        let Some(previous) = previous else { return };
        let state = self.state();
        let new_entries: HashSet<Txid> = state.history.get(address).map(|h| h.entries().iter().map(|(t, _)| *t).collect()).unwrap_or_default();
        let dropped: Vec<Txid> = previous.entries().iter().map(|(t, _)| *t).filter(|t| !new_entries.contains(t)).collect();
        if dropped.is_empty() {
            return;
        }
        let referenced_elsewhere = |txid: &Txid| state.history.iter().any(|(addr, h)| addr != address && h.contains(txid));
        let network = self.inner().network;
        let txs = self.txs();

        let mut watch = self.orphan_watch.lock().expect("orphan_watch poisoned");
        let mut pending = self.pending_history_requests.lock().expect("pending_history_requests poisoned");
        for txid in dropped {
            if referenced_elsewhere(&txid) || watch.contains_key(&txid) {
                continue;
            }
            let Some(tx) = txs.get(&txid) else { continue };
            let output_addresses: HashSet<String> =
                tx.output.iter().filter_map(|o| self.address_for_script(&o.script_pubkey, network)).map(|a| a.to_string()).collect();
            if output_addresses.is_empty() {
                continue;
            }
            warn!("orphan recovery: {txid} dropped from {address}'s history, cross-checking output addresses");
            pending.extend(output_addresses.iter().cloned());
            watch.insert(txid, output_addresses);
        }
    }
}

impl SyncTarget for WalletCore {
    fn synchronize_addresses(&self) -> Vec<String> {
        self.synchronize().unwrap_or_else(|e| {
            warn!("synchronize failed: {e}");
            Vec::new()
        })
    }

    fn get_history(&self, address: &str) -> Option<History> {
        self.state().history.get(address).cloned()
    }

    /// `receive_history_callback`: validates `check_new_history`-equivalent
    /// consistency, detects transactions orphaned by the update, then stores
    /// the new history under `state_lock`.
    fn receive_history_callback(&self, address: &str, history: History) -> Result<(), Error> {
        {
            let network = self.inner().network;
            let txs = self.txs();
            if let History::Entries(entries) = &history {
                for (txid, _) in entries {
                    if let Some(tx) = txs.get(txid) {
                        let pays_address = tx
                            .output
                            .iter()
                            .any(|o| self.address_for_script(&o.script_pubkey, network).map(|a| a.to_string() == address).unwrap_or(false));
                        if !pays_address {
                            return Err(Error::HistoryInconsistent(address.to_string()));
                        }
                    }
                }
            }
        }

        let previous = {
            let mut state = self.state();
            let previous = state.history.insert(address.to_string(), history.clone());
            // resolve any txid we're watching that this address could confirm
            let mut watch = self.orphan_watch.lock().expect("orphan_watch poisoned");
            let mut resolved = Vec::new();
            for (txid, waiting_on) in watch.iter_mut() {
                if !waiting_on.remove(address) {
                    continue;
                }
                if history.contains(txid) {
                    resolved.push((*txid, true));
                } else if waiting_on.is_empty() {
                    resolved.push((*txid, false));
                }
            }
            for (txid, _) in &resolved {
                watch.remove(txid);
            }
            drop(watch);
            drop(state);

            let mut txs = self.txs();
            for (txid, confirmed) in resolved {
                if !confirmed {
                    warn!("orphan recovery: no output address reported {txid}, pruning");
                    if let Some(pruned) = txs.remove(&txid) {
                        for (vout, _) in pruned.output.iter().enumerate() {
                            txs.unmark_spent(&(txid, vout as u32));
                        }
                    }
                }
            }
            previous
        };

        self.detect_orphans(address, previous.as_ref());
        self.persist()
    }

    /// `receive_tx_callback`: runs `check_new_tx` under `transaction_lock`,
    /// inserts the transaction, and updates the prevout/spent tables.
    fn receive_tx_callback(&self, txid: Txid, tx: Transaction, _height: u32) -> Result<(), Error> {
        let network = self.inner().network;
        let history_by_script: HashMap<bitcoin::ScriptBuf, History> = {
            let state = self.state();
            state
                .history
                .iter()
                .filter_map(|(addr, hist)| {
                    Address::from_str(addr).ok().and_then(|a| a.require_network(network).ok()).map(|a| (a.script_pubkey(), hist.clone()))
                })
                .collect()
        };

        if !check_new_tx(&history_by_script, &txid, &tx) {
            info!("received transaction that is no longer referenced in history: {txid}");
            return Ok(());
        }

        let mut txs = self.txs();
        for (vout, output) in tx.output.iter().enumerate() {
            if let Some(addr) = self.address_for_script(&output.script_pubkey, network) {
                txs.set_prevout_value((txid, vout as u32), addr.to_string(), output.value.to_sat());
            }
        }
        for input in &tx.input {
            txs.mark_spent((input.previous_output.txid, input.previous_output.vout));
        }
        txs.insert(txid, tx);
        drop(txs);
        self.persist()
    }

    fn has_transaction(&self, txid: &Txid) -> bool {
        self.txs().contains(txid)
    }

    fn is_up_to_date(&self) -> bool {
        self.state().up_to_date
    }

    fn set_up_to_date(&self, up_to_date: bool) {
        self.state().up_to_date = up_to_date;
    }

    fn take_pending_history_requests(&self) -> Vec<String> {
        let mut pending = self.pending_history_requests.lock().expect("pending_history_requests poisoned");
        std::mem::take(&mut *pending)
    }
}

/// Draws fresh random bytes for callers that need a nonce outside the
/// crypto crate (e.g. test fixtures); production code paths use
/// `wallet_crypto`'s own RNG internally.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_wallet() -> (tempfile::TempDir, WalletCore) {
        let dir = tempfile::tempdir().unwrap();
        let wallet = WalletCore::open(dir.path().join("wallet.dat"), Network::Testnet).unwrap();
        (dir, wallet)
    }

    #[test]
    fn new_wallet_creation_produces_main_account_with_gap_limit_addresses() {
        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();

        let inner = wallet.inner();
        assert!(inner.accounts.contains_key("m/0'/0"));
        assert_eq!(wallet.get_label("m/0'/0").as_deref(), Some("Main account"));
        drop(inner);

        assert_eq!(wallet.addresses(false, false).len(), GAP_LIMIT_DEFAULT as usize);
    }

    #[test]
    fn init_seed_twice_fails() {
        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        assert!(matches!(wallet.init_seed(None), Err(Error::SeedAlreadyExists)));
    }

    #[test]
    fn password_change_round_trips_seed() {
        let (_dir, wallet) = new_wallet();
        let seed = wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();

        wallet.update_password("", "hunter2").unwrap();
        assert!(wallet.inner().use_encryption);
        assert!(wallet.decode_seed("").is_err());

        wallet.update_password("hunter2", "").unwrap();
        assert!(!wallet.inner().use_encryption);
        let recovered = wallet.decode_seed("").unwrap();
        assert_eq!(hex::encode(recovered), seed);
    }

    #[test]
    fn freeze_and_prioritize_are_mutually_exclusive() {
        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();
        let addr = wallet.addresses(false, false)[0].clone();

        assert!(wallet.freeze(&addr));
        assert!(wallet.prioritize(&addr));
        let (frozen, prioritized) = wallet.get_address_flags(&addr);
        assert!(!frozen);
        assert!(prioritized);
    }

    #[test]
    fn freeze_non_mine_address_is_a_no_op() {
        let (_dir, wallet) = new_wallet();
        assert!(!wallet.freeze("not-mine"));
    }

    #[test]
    fn orphaned_transaction_is_pruned_once_no_output_address_reports_it() {
        use bitcoin::hashes::Hash;

        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();
        let addresses = wallet.addresses(false, false);
        let addr_a = addresses[0].clone();
        let addr_b = addresses[1].clone();
        let network = wallet.inner().network;

        let script_a = Address::from_str(&addr_a).unwrap().require_network(network).unwrap().script_pubkey();
        let script_b = Address::from_str(&addr_b).unwrap().require_network(network).unwrap().script_pubkey();
        let txid = Txid::from_byte_array([7u8; 32]);
        let tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![
                bitcoin::TxOut { value: bitcoin::Amount::from_sat(1000), script_pubkey: script_a },
                bitcoin::TxOut { value: bitcoin::Amount::from_sat(2000), script_pubkey: script_b },
            ],
        };

        SyncTarget::receive_history_callback(&wallet, &addr_a, History::Entries(vec![(txid, 100)])).unwrap();
        SyncTarget::receive_tx_callback(&wallet, txid, tx, 100).unwrap();
        assert!(SyncTarget::has_transaction(&wallet, &txid));

        // addr_a's history no longer lists the tx, and nothing else references it yet.
        SyncTarget::receive_history_callback(&wallet, &addr_a, History::Entries(vec![])).unwrap();

        let pending = SyncTarget::take_pending_history_requests(&wallet);
        assert!(pending.contains(&addr_a));
        assert!(pending.contains(&addr_b));
        // still cached: waiting on the cross-request results
        assert!(SyncTarget::has_transaction(&wallet, &txid));

        // cross-request for addr_b comes back empty.
        SyncTarget::receive_history_callback(&wallet, &addr_b, History::Entries(vec![])).unwrap();
        assert!(SyncTarget::has_transaction(&wallet, &txid));

        // cross-request for addr_a (the last one we're waiting on) also comes back empty.
        SyncTarget::receive_history_callback(&wallet, &addr_a, History::Entries(vec![])).unwrap();
        assert!(!SyncTarget::has_transaction(&wallet, &txid));
    }

    #[test]
    fn orphan_watch_is_cleared_when_a_cross_checked_address_reports_the_tx() {
        use bitcoin::hashes::Hash;

        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();
        let addresses = wallet.addresses(false, false);
        let addr_a = addresses[0].clone();
        let addr_b = addresses[1].clone();
        let network = wallet.inner().network;

        let script_a = Address::from_str(&addr_a).unwrap().require_network(network).unwrap().script_pubkey();
        let script_b = Address::from_str(&addr_b).unwrap().require_network(network).unwrap().script_pubkey();
        let txid = Txid::from_byte_array([8u8; 32]);
        let tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![
                bitcoin::TxOut { value: bitcoin::Amount::from_sat(1000), script_pubkey: script_a },
                bitcoin::TxOut { value: bitcoin::Amount::from_sat(2000), script_pubkey: script_b },
            ],
        };

        SyncTarget::receive_history_callback(&wallet, &addr_a, History::Entries(vec![(txid, 100)])).unwrap();
        SyncTarget::receive_tx_callback(&wallet, txid, tx, 100).unwrap();
        SyncTarget::receive_history_callback(&wallet, &addr_a, History::Entries(vec![])).unwrap();

        // addr_b turns out to confirm it after all.
        SyncTarget::receive_history_callback(&wallet, &addr_b, History::Entries(vec![(txid, 101)])).unwrap();
        assert!(SyncTarget::has_transaction(&wallet, &txid));
    }

    struct StubVerifier;
    impl crate::synchronizer::SpvVerifier for StubVerifier {
        fn add(&self, _txid: Txid, _height: u32) {}
        fn get_height(&self, _txid: &Txid) -> Option<u32> {
            None
        }
        fn get_confirmations(&self, _txid: &Txid) -> (Option<u32>, Option<u64>) {
            (Some(6), Some(1_700_000_000))
        }
        fn get_txpos(&self, _txid: &Txid) -> u64 {
            0
        }
    }

    #[test]
    fn create_pending_accounts_materializes_once_its_candidate_address_has_history() {
        use bitcoin::hashes::Hash;

        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();

        let candidate = wallet.new_account_address("1").unwrap().unwrap();
        assert!(!wallet.inner().accounts.contains_key("m/0'/1"));

        SyncTarget::receive_history_callback(&wallet, &candidate, History::Entries(vec![(Txid::from_byte_array([9u8; 32]), 100)])).unwrap();

        wallet.create_pending_accounts().unwrap();
        assert!(wallet.inner().accounts.contains_key("m/0'/1"));
    }

    #[test]
    fn create_pending_accounts_leaves_fresh_candidate_address_untouched() {
        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();

        wallet.create_pending_accounts().unwrap();
        assert!(!wallet.inner().accounts.contains_key("m/0'/1"));
    }

    #[test]
    fn mktx_produces_a_valid_looking_p2pkh_scriptsig_for_every_input() {
        use bitcoin::hashes::Hash;

        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();
        let addresses = wallet.addresses(false, false);
        let funded = addresses[0].clone();
        let network = wallet.inner().network;

        let script = Address::from_str(&funded).unwrap().require_network(network).unwrap().script_pubkey();
        let funding_txid = Txid::from_byte_array([3u8; 32]);
        let funding_tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![bitcoin::TxOut { value: bitcoin::Amount::from_sat(100_000), script_pubkey: script }],
        };
        SyncTarget::receive_history_callback(&wallet, &funded, History::Entries(vec![(funding_txid, 100)])).unwrap();
        SyncTarget::receive_tx_callback(&wallet, funding_txid, funding_tx, 100).unwrap();

        let destination = addresses[1].clone();
        let tx = wallet.mktx(vec![(destination, bitcoin::Amount::from_sat(10_000))], "", None, None, None).unwrap();

        assert_eq!(tx.input.len(), 1);
        let pushes: Vec<Vec<u8>> = tx.input[0]
            .script_sig
            .instructions()
            .filter_map(|i| i.ok())
            .filter_map(|i| match i {
                bitcoin::script::Instruction::PushBytes(b) => Some(b.as_bytes().to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(pushes.len(), 2);
        assert!(pushes[0].len() >= 70 && pushes[0].len() <= 72);
        assert_eq!(pushes[1].len(), 33);
    }

    #[test]
    fn get_tx_history_accumulates_running_balance_without_discrepancy() {
        use bitcoin::hashes::Hash;

        let (_dir, wallet) = new_wallet();
        wallet.init_seed(None).unwrap();
        wallet.create_accounts("").unwrap();
        let addresses = wallet.addresses(false, false);
        let funded = addresses[0].clone();
        let network = wallet.inner().network;

        let script = Address::from_str(&funded).unwrap().require_network(network).unwrap().script_pubkey();
        let funding_txid = Txid::from_byte_array([4u8; 32]);
        let funding_tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![bitcoin::TxOut { value: bitcoin::Amount::from_sat(50_000), script_pubkey: script }],
        };
        SyncTarget::receive_history_callback(&wallet, &funded, History::Entries(vec![(funding_txid, 100)])).unwrap();
        SyncTarget::receive_tx_callback(&wallet, funding_txid, funding_tx, 100).unwrap();

        let rows = wallet.get_tx_history(None, &StubVerifier);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].txid, Some(funding_txid));
        assert_eq!(rows[0].value, 50_000);
        let (confirmed, unconfirmed) = wallet.get_balance();
        assert_eq!(rows[0].running_balance, confirmed + unconfirmed);
    }
}
