//! Coin selection and change placement, building up the inputs/outputs of an
//! unsigned transaction one piece at a time the way the legacy `mktx`
//! pipeline does: `choose_tx_inputs` picks inputs and estimates a fee,
//! `add_tx_change` appends a change output at a randomized position.
use bitcoin::{Amount, OutPoint, Txid};
use rand::Rng;

use crate::error::Error;

/// One spendable output the coin selector can draw from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub address: String,
    pub value: Amount,
}

/// Inputs chosen for a transaction, the fee estimated for them, and their
/// total value — everything `add_tx_change` needs to compute the change.
#[derive(Clone, Debug)]
pub struct SelectedInputs {
    pub inputs: Vec<Utxo>,
    pub total: Amount,
    pub fee: Amount,
}

/// `estimated_fee`: assumes uncompressed-key-sized inputs (180 bytes) plus
/// 80 bytes of fixed overhead, rounded up to the nearest kilobyte and
/// multiplied by the configured per-kb rate. Never estimates below one
/// full per-kb rate, so a single-input tx isn't charged zero fee.
pub fn estimated_fee(num_inputs: usize, fee_per_kb: Amount) -> Amount {
    let estimated_size = num_inputs as u64 * 180 + 80;
    let kb = ((estimated_size as f64) / 1024.0).round() as u64;
    let fee = fee_per_kb.to_sat() * kb;
    let fee = if fee == 0 { fee_per_kb.to_sat() } else { fee };
    Amount::from_sat(fee)
}

/// Greedily accumulates UTXOs from `prioritized` first, then `ordinary`,
/// until the running total covers `amount` plus the fee that total's input
/// count would incur, re-estimating the fee after each input is added
/// (`fixed_fee`, when given, short-circuits re-estimation). Returns `None`
/// if every UTXO across both pools is exhausted without reaching the target
/// — the caller should surface this as [`Error::InsufficientFunds`].
pub fn choose_tx_inputs(
    amount: Amount,
    fixed_fee: Option<Amount>,
    default_fee_per_kb: Amount,
    prioritized: &[Utxo],
    ordinary: &[Utxo],
) -> Option<SelectedInputs> {
    let mut total = Amount::ZERO;
    let mut fee = fixed_fee.unwrap_or(default_fee_per_kb);
    let mut inputs = Vec::new();

    for utxo in prioritized.iter().chain(ordinary.iter()) {
        total += utxo.value;
        inputs.push(utxo.clone());
        fee = fixed_fee.unwrap_or_else(|| estimated_fee(inputs.len(), default_fee_per_kb));
        if total >= amount + fee {
            return Some(SelectedInputs { inputs, total, fee });
        }
    }
    None
}

/// Excludes frozen and already-prioritized addresses from the ordinary
/// selection pool, per the legacy source's `choose_tx_inputs` domain
/// filtering (frozen addresses never spend automatically; prioritized
/// addresses are drawn from their own separate pool first).
pub fn partition_spendable(
    all_utxos: Vec<Utxo>,
    frozen_addresses: &std::collections::HashSet<String>,
    prioritized_addresses: &std::collections::HashSet<String>,
) -> (Vec<Utxo>, Vec<Utxo>) {
    let mut prioritized = Vec::new();
    let mut ordinary = Vec::new();
    for utxo in all_utxos {
        if frozen_addresses.contains(&utxo.address) {
            continue;
        }
        if prioritized_addresses.contains(&utxo.address) {
            prioritized.push(utxo);
        } else {
            ordinary.push(utxo);
        }
    }
    (prioritized, ordinary)
}

/// Where to send leftover value after paying `amount` and `fee` out of
/// `total`. Caller-supplied addresses win; failing that, a non-change
/// wallet or an externally-sourced input set falls back to the last input's
/// address; otherwise the account's designated change address is used.
pub enum ChangeAddressPolicy<'a> {
    Explicit(&'a str),
    LastInputAddress,
    AccountChangeAddress(&'a str),
}

/// Computes the change output, if any, and where it should land in the
/// output list. Returns `None` when `total` exactly covers `amount + fee`
/// (no change needed — the legacy source's `change_amount != 0` guard).
///
/// The position is chosen uniformly at random among the possible insertion
/// points, including the very end, so a change output doesn't
/// systematically end up first or last and leak which output is change.
pub fn add_tx_change(
    inputs: &[Utxo],
    num_outputs: usize,
    amount: Amount,
    fee: Amount,
    total: Amount,
    change_policy: ChangeAddressPolicy<'_>,
) -> Result<Option<(String, Amount, usize)>, Error> {
    let spend = amount + fee;
    if total < spend {
        return Err(Error::InsufficientFunds);
    }
    let change_amount = total - spend;
    if change_amount == Amount::ZERO {
        return Ok(None);
    }

    let change_addr = match change_policy {
        ChangeAddressPolicy::Explicit(addr) => addr.to_string(),
        ChangeAddressPolicy::LastInputAddress => inputs.last().ok_or(Error::InsufficientFunds)?.address.clone(),
        ChangeAddressPolicy::AccountChangeAddress(addr) => addr.to_string(),
    };

    let position = rand::thread_rng().gen_range(0..=num_outputs);
    Ok(Some((change_addr, change_amount, position)))
}

/// Resolves an `InputInfo`-or-known-UTXO prevout lookup used by
/// `signrawtransaction` to find a spent output's scriptPubKey/value when the
/// wallet's own cache doesn't already have it recorded.
#[derive(Clone, Debug)]
pub struct InputInfo {
    pub txid: Txid,
    pub vout: u32,
    pub script_pubkey: bitcoin::ScriptBuf,
    pub redeem_script: Option<bitcoin::ScriptBuf>,
    pub key_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn utxo(byte: u8, sats: u64, address: &str) -> Utxo {
        Utxo { outpoint: OutPoint::new(Txid::from_byte_array([byte; 32]), 0), address: address.to_string(), value: Amount::from_sat(sats) }
    }

    #[test]
    fn estimated_fee_never_rounds_to_zero() {
        let fee = estimated_fee(1, Amount::from_sat(1000));
        assert!(fee > Amount::ZERO);
    }

    #[test]
    fn estimated_fee_scales_with_input_count() {
        let small = estimated_fee(1, Amount::from_sat(20_000));
        let large = estimated_fee(20, Amount::from_sat(20_000));
        assert!(large >= small);
    }

    #[test]
    fn choose_tx_inputs_prefers_prioritized_pool_first() {
        let prioritized = vec![utxo(1, 50_000, "addrA")];
        let ordinary = vec![utxo(2, 100_000, "addrB")];
        let selected = choose_tx_inputs(Amount::from_sat(40_000), None, Amount::from_sat(1000), &prioritized, &ordinary).unwrap();
        assert_eq!(selected.inputs[0].address, "addrA");
    }

    #[test]
    fn choose_tx_inputs_accumulates_until_covering_amount_and_fee() {
        let ordinary = vec![utxo(1, 10_000, "a"), utxo(2, 10_000, "b"), utxo(3, 100_000, "c")];
        let selected = choose_tx_inputs(Amount::from_sat(25_000), None, Amount::from_sat(1000), &[], &ordinary).unwrap();
        assert!(selected.total >= Amount::from_sat(25_000) + selected.fee);
        assert_eq!(selected.inputs.len(), 3);
    }

    #[test]
    fn choose_tx_inputs_returns_none_when_funds_insufficient() {
        let ordinary = vec![utxo(1, 100, "a")];
        assert!(choose_tx_inputs(Amount::from_sat(1_000_000), None, Amount::from_sat(1000), &[], &ordinary).is_none());
    }

    #[test]
    fn partition_spendable_excludes_frozen_and_separates_prioritized() {
        let utxos = vec![utxo(1, 1000, "frozen"), utxo(2, 1000, "priority"), utxo(3, 1000, "plain")];
        let frozen = std::collections::HashSet::from(["frozen".to_string()]);
        let prioritized_set = std::collections::HashSet::from(["priority".to_string()]);
        let (prioritized, ordinary) = partition_spendable(utxos, &frozen, &prioritized_set);
        assert_eq!(prioritized.len(), 1);
        assert_eq!(prioritized[0].address, "priority");
        assert_eq!(ordinary.len(), 1);
        assert_eq!(ordinary[0].address, "plain");
    }

    #[test]
    fn add_tx_change_is_none_when_total_exactly_covers_spend() {
        let inputs = vec![utxo(1, 10_000, "a")];
        let result = add_tx_change(&inputs, 1, Amount::from_sat(9_000), Amount::from_sat(1_000), Amount::from_sat(10_000), ChangeAddressPolicy::LastInputAddress).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn add_tx_change_falls_back_to_last_input_address() {
        let inputs = vec![utxo(1, 10_000, "a"), utxo(2, 10_000, "last")];
        let (addr, amount, _pos) = add_tx_change(&inputs, 1, Amount::from_sat(9_000), Amount::from_sat(1_000), Amount::from_sat(20_000), ChangeAddressPolicy::LastInputAddress).unwrap().unwrap();
        assert_eq!(addr, "last");
        assert_eq!(amount, Amount::from_sat(10_000));
    }

    #[test]
    fn add_tx_change_rejects_insufficient_total() {
        let inputs = vec![utxo(1, 100, "a")];
        let err = add_tx_change(&inputs, 1, Amount::from_sat(1_000), Amount::from_sat(100), Amount::from_sat(100), ChangeAddressPolicy::LastInputAddress).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
    }
}
