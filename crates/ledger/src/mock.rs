//! In-memory ledger used by tests: a growing chain of blocks plus an account
//! table, with controllable broadcast failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use chainvoice_core::{Error, Result};

use crate::{
    AccountInfo, Amount, AppliedOperation, Block, BlockTransaction, BroadcastReceipt, LedgerClient,
    Operation, WriteKey,
};

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, AccountInfo>,
    blocks: Vec<Block>,
    broadcast_failure: Option<String>,
    account_lookups: u64,
    tx_counter: u64,
}

impl MockState {
    fn next_tx_id(&mut self) -> String {
        self.tx_counter += 1;
        format!("{:040x}", self.tx_counter)
    }

    fn append_block(&mut self, operations: Vec<Operation>) -> BroadcastReceipt {
        let transaction_id = self.next_tx_id();
        let height = self.blocks.len() as u64 + 1;
        self.blocks.push(Block {
            height,
            transactions: vec![BlockTransaction {
                transaction_id: transaction_id.clone(),
                operations,
            }],
        });
        BroadcastReceipt {
            transaction_id,
            block_number: height,
            transaction_number: 0,
        }
    }
}

#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_account(&self, handle: &str, encryption_key: &str) {
        let mut state = self.state.lock().expect("mock state");
        state.accounts.insert(
            handle.to_string(),
            AccountInfo {
                handle: handle.to_string(),
                encryption_key: encryption_key.to_string(),
            },
        );
    }

    /// Append a block carrying a single transfer; returns its transaction id.
    pub fn push_transfer(&self, from: &str, to: &str, amount: Amount, memo: &str) -> String {
        let mut state = self.state.lock().expect("mock state");
        state
            .append_block(vec![Operation::Transfer {
                from: from.to_string(),
                to: to.to_string(),
                amount,
                memo: memo.to_string(),
            }])
            .transaction_id
    }

    pub fn fail_broadcasts_with(&self, reason: &str) {
        self.state.lock().expect("mock state").broadcast_failure = Some(reason.to_string());
    }

    pub fn clear_broadcast_failure(&self) {
        self.state.lock().expect("mock state").broadcast_failure = None;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().expect("mock state").blocks.len() as u64
    }

    pub fn account_lookups(&self) -> u64 {
        self.state.lock().expect("mock state").account_lookups
    }

    /// All operations broadcast or pushed so far, in chain order.
    pub fn operations(&self) -> Vec<Operation> {
        let state = self.state.lock().expect("mock state");
        state
            .blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .flat_map(|t| t.operations.iter())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn broadcast(&self, operations: Vec<Operation>, _key: &WriteKey) -> Result<BroadcastReceipt> {
        let mut state = self.state.lock().expect("mock state");
        if let Some(reason) = state.broadcast_failure.clone() {
            return Err(Error::classify_broadcast(reason));
        }
        Ok(state.append_block(operations))
    }

    async fn head_block(&self) -> Result<u64> {
        Ok(self.head())
    }

    async fn get_block(&self, height: u64) -> Result<Option<Block>> {
        let state = self.state.lock().expect("mock state");
        if height == 0 {
            return Ok(None);
        }
        Ok(state.blocks.get(height as usize - 1).cloned())
    }

    async fn get_account(&self, handle: &str) -> Result<Option<AccountInfo>> {
        let mut state = self.state.lock().expect("mock state");
        state.account_lookups += 1;
        Ok(state.accounts.get(handle).cloned())
    }

    async fn account_history(&self, handle: &str, limit: usize) -> Result<Vec<AppliedOperation>> {
        let state = self.state.lock().expect("mock state");
        let mut history: Vec<AppliedOperation> = Vec::new();
        for block in &state.blocks {
            for tx in &block.transactions {
                for op in &tx.operations {
                    let involved = match op {
                        Operation::Transfer { from, to, .. } => from == handle || to == handle,
                        Operation::Custom { author, .. } => author == handle,
                        Operation::Post { author, .. } => author == handle,
                    };
                    if involved {
                        history.push(AppliedOperation {
                            block_number: block.height,
                            transaction_id: tx.transaction_id.clone(),
                            operation: op.clone(),
                        });
                    }
                }
            }
        }
        let skip = history.len().saturating_sub(limit);
        Ok(history.split_off(skip))
    }
}
