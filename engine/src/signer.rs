//! Builds and signs plain value transfers.

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};

use crate::account::Account;
use crate::client::SignedTx;
use crate::consts::TRANSFER_GAS_LIMIT;
use crate::error::ChainError;

/// Sign a legacy (gas price) transfer of `value` wei from `account` to `to`
pub fn sign_transfer(
    account: &Account,
    to: Address,
    value: U256,
    nonce: u64,
    gas_price: u128,
    chain_id: u64,
) -> Result<SignedTx, ChainError> {
    let mut tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price,
        gas_limit: TRANSFER_GAS_LIMIT,
        to: TxKind::Call(to),
        value,
        input: Bytes::new(),
    };

    let signature = TxSignerSync::sign_transaction_sync(account.signer(), &mut tx)
        .map_err(|e| ChainError::Signing(e.to_string()))?;
    let envelope: TxEnvelope = tx.into_signed(signature).into();

    Ok(SignedTx {
        hash: *envelope.tx_hash(),
        from: account.address(),
        raw: Bytes::from(envelope.encoded_2718()),
        nonce,
        gas_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;

    #[test]
    fn test_signed_transfer_hash_matches_raw_bytes() {
        let account = Account::random();
        let to = Account::random().address();
        let signed = sign_transfer(&account, to, U256::from(1_000u64), 7, 5_000_000_000, 2370).unwrap();

        assert_eq!(signed.nonce, 7);
        assert_eq!(signed.from, account.address());
        assert_eq!(signed.gas_price, 5_000_000_000);
        assert_eq!(keccak256(&signed.raw), signed.hash);
    }

    #[test]
    fn test_different_nonces_produce_different_transactions() {
        let account = Account::random();
        let to = Account::random().address();
        let a = sign_transfer(&account, to, U256::from(1u64), 0, 1, 1).unwrap();
        let b = sign_transfer(&account, to, U256::from(1u64), 1, 1, 1).unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.raw, b.raw);
    }
}
