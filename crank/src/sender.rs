//! JSON-RPC chain client
//!
//! Talks to an EVM node over HTTP with plain `eth_*` calls

use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use walletflood::{ChainClient, ChainError, Receipt, SignedTx};

/// Default delay between receipt polls while waiting for confirmations
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// HTTP JSON-RPC client
pub struct RpcClient {
    client: reqwest::Client,
    rpc_url: String,
    poll_interval: Duration,
}

impl RpcClient {
    pub fn new(rpc_url: String) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChainError::Network(e.to_string()))?;

        Ok(Self {
            client,
            rpc_url,
            poll_interval: RECEIPT_POLL_INTERVAL,
        })
    }

    /// Issue one JSON-RPC call and return its `result`
    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;

        let mut json: Value = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                ChainError::Parse(format!("{}: {}", method, e))
            } else {
                ChainError::Network(format!("HTTP {}: {}", status, text))
            }
        })?;

        if let Some(error) = json.get("error") {
            return Err(rpc_error(error));
        }

        Ok(json
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let result = self.call("eth_blockNumber", serde_json::json!([])).await?;
        parse_u64(&result)
    }

    /// Receipt for `tx_hash`, or `None` while it is still pending
    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let result = self
            .call("eth_getTransactionReceipt", serde_json::json!([tx_hash.to_string()]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        parse_receipt(tx_hash, &result).map(Some)
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        let result = self.call("eth_chainId", serde_json::json!([])).await?;
        parse_u64(&result)
    }

    async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let result = self
            .call(
                "eth_getTransactionCount",
                serde_json::json!([address.to_string(), "latest"]),
            )
            .await?;
        parse_u64(&result)
    }

    async fn get_gas_price(&self) -> Result<u128, ChainError> {
        let result = self.call("eth_gasPrice", serde_json::json!([])).await?;
        parse_quantity(&result)
    }

    async fn submit(&self, tx: &SignedTx) -> Result<TxHash, ChainError> {
        let result = self
            .call("eth_sendRawTransaction", serde_json::json!([tx.raw.to_string()]))
            .await?;

        let hash_str = result
            .as_str()
            .ok_or_else(|| ChainError::Parse("No result in response".to_string()))?;
        TxHash::from_str(hash_str).map_err(|e| ChainError::Parse(e.to_string()))
    }

    async fn wait_confirmed(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if confirmations <= 1 || !receipt.success {
                        return Ok(receipt);
                    }
                    match self.block_number().await {
                        Ok(head) if head + 1 >= receipt.block_number + confirmations => {
                            return Ok(receipt);
                        }
                        Ok(_) => {}
                        Err(e) => debug!("Block number poll failed for {}: {}", tx_hash, e),
                    }
                }
                Ok(None) => {}
                // Keep polling through transient failures until the deadline
                Err(e) => debug!("Receipt poll failed for {}: {}", tx_hash, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ChainError::Timeout(format!(
                    "{} not confirmed at depth {} within {:?}",
                    tx_hash, confirmations, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

fn rpc_error(error: &Value) -> ChainError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    ChainError::Rpc { code, message }
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_quantity(value: &Value) -> Result<u128, ChainError> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Parse(format!("expected hex quantity, got {}", value)))?;
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::Parse(format!("missing 0x prefix: {}", s)))?;
    if digits.is_empty() {
        return Err(ChainError::Parse("empty quantity".to_string()));
    }
    u128::from_str_radix(digits, 16).map_err(|e| ChainError::Parse(format!("{}: {}", s, e)))
}

/// Hex quantity that must fit a `u64` (nonces, block numbers, chain ids)
pub fn parse_u64(value: &Value) -> Result<u64, ChainError> {
    let quantity = parse_quantity(value)?;
    u64::try_from(quantity)
        .map_err(|_| ChainError::Parse(format!("quantity {} does not fit in u64", quantity)))
}

fn parse_receipt(tx_hash: TxHash, json: &Value) -> Result<Receipt, ChainError> {
    let block_number = parse_u64(&json["blockNumber"])?;
    let gas_used = parse_u64(&json["gasUsed"])?;
    // Pre-Byzantium receipts carry no status
    let success = match json.get("status") {
        Some(status) if !status.is_null() => parse_quantity(status)? == 1,
        _ => true,
    };

    Ok(Receipt {
        tx_hash,
        block_number,
        success,
        gas_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert_eq!(parse_quantity(&json!("0x942")).unwrap(), 2370);
        assert_eq!(parse_quantity(&json!("0x2540be400")).unwrap(), 10_000_000_000);
        assert!(parse_quantity(&json!("0x")).is_err());
        assert!(parse_quantity(&json!("42")).is_err());
        assert!(parse_quantity(&json!(42)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }

    #[test]
    fn test_parse_u64_rejects_oversized_quantities() {
        assert_eq!(parse_u64(&json!("0xffffffffffffffff")).unwrap(), u64::MAX);
        assert!(matches!(
            parse_u64(&json!("0x10000000000000000")),
            Err(ChainError::Parse(_))
        ));

        // A block number past u64 must not wrap into a small one
        let hash = TxHash::repeat_byte(0xcd);
        assert!(parse_receipt(
            hash,
            &json!({"blockNumber": "0x10000000000000010", "gasUsed": "0x5208", "status": "0x1"}),
        )
        .is_err());
    }

    #[test]
    fn test_rpc_error_mapping() {
        let error = rpc_error(&json!({"code": -32000, "message": "nonce too low"}));
        assert!(matches!(
            error,
            ChainError::Rpc { code: -32000, ref message } if message == "nonce too low"
        ));

        let error = rpc_error(&json!("boom"));
        assert!(matches!(error, ChainError::Rpc { code: -32000, .. }));
    }

    #[test]
    fn test_parse_receipt() {
        let hash = TxHash::repeat_byte(0xab);
        let receipt = parse_receipt(
            hash,
            &json!({"blockNumber": "0x10", "gasUsed": "0x5208", "status": "0x1"}),
        )
        .unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas_used, 21_000);
        assert!(receipt.success);

        let reverted = parse_receipt(
            hash,
            &json!({"blockNumber": "0x10", "gasUsed": "0x5208", "status": "0x0"}),
        )
        .unwrap();
        assert!(!reverted.success);
    }

    // ------------------------------------------------------------------------
    // Against a canned HTTP node
    // ------------------------------------------------------------------------

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use walletflood::{classify, ErrorKind};

    /// Serve `responses` in order, one per connection; the last one repeats
    async fn canned_node(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut index = 0;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;

                let (status, body) = &responses[index.min(responses.len() - 1)];
                index += 1;
                let reply = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return;
                }
            }
        }
    }

    fn local_client(rpc_url: String) -> RpcClient {
        RpcClient {
            client: reqwest::Client::builder()
                .no_proxy()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
            rpc_url,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn ok(result: Value) -> (u16, String) {
        (200, json!({"jsonrpc": "2.0", "id": 1, "result": result}).to_string())
    }

    fn receipt_json(block: &str) -> Value {
        json!({"blockNumber": block, "gasUsed": "0x5208", "status": "0x1"})
    }

    #[tokio::test]
    async fn test_chain_id_and_gas_price() {
        let url = canned_node(vec![ok(json!("0x942")), ok(json!("0x2540be400"))]).await;
        let client = local_client(url);

        assert_eq!(client.chain_id().await.unwrap(), 2370);
        assert_eq!(client.get_gas_price().await.unwrap(), 10_000_000_000);
    }

    #[tokio::test]
    async fn test_rpc_rejection_is_classified() {
        let url = canned_node(vec![(
            200,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "nonce too low: next nonce 5, tx nonce 3"}})
                .to_string(),
        )])
        .await;
        let client = local_client(url);

        let error = client.get_nonce(Address::ZERO).await.unwrap_err();
        assert!(matches!(error, ChainError::Rpc { code: -32000, .. }));
        assert_eq!(classify(&error), ErrorKind::NonceConflict);
    }

    #[tokio::test]
    async fn test_http_failure_is_a_network_error() {
        let url = canned_node(vec![(502, "bad gateway".to_string())]).await;
        let client = local_client(url);

        let error = client.chain_id().await.unwrap_err();
        assert!(matches!(error, ChainError::Network(_)));
        assert!(classify(&error).is_retryable());
    }

    #[tokio::test]
    async fn test_wait_confirmed_waits_for_depth() {
        let url = canned_node(vec![
            ok(Value::Null),
            ok(receipt_json("0x10")),
            ok(json!("0x10")),
            ok(receipt_json("0x10")),
            ok(json!("0x11")),
        ])
        .await;
        let client = local_client(url);

        let hash = TxHash::repeat_byte(0x01);
        let receipt = client
            .wait_confirmed(hash, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(receipt.tx_hash, hash);
        assert_eq!(receipt.block_number, 16);
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn test_wait_confirmed_times_out() {
        let url = canned_node(vec![ok(Value::Null)]).await;
        let client = local_client(url);

        let error = client
            .wait_confirmed(TxHash::repeat_byte(0x02), 1, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(error, ChainError::Timeout(_)));
    }
}
