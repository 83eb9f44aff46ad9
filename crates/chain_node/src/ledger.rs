//! Account ledger state machine.
//!
//! The consensus layer treats transaction payloads as opaque bytes; this
//! module decodes them into ledger commands, validates them against account
//! state, and reports the keys each transaction actually touched so the
//! executor can enforce the declared access set. Validation failures
//! (insufficient balance, out-of-sequence nonce) are business-level rejects
//! recorded in the batch result; they never fail the batch.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use chain_raft::raft::{AccessKeys, StateMachine, Transaction, TxApply, TxOutcome};

/// One ledger account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    /// Last used transfer nonce; replay protection for transfers.
    pub nonce: u64,
}

/// Commands the ledger decodes from a transaction payload (JSON).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxCommand {
    /// Credit an account. Used for devnet/test seeding; not replay-protected.
    Mint { account: String, amount: u64 },
    /// Move funds between accounts. `nonce` must be exactly one above the
    /// sender's last used nonce, so a replayed transfer is rejected instead
    /// of double-spending.
    Transfer {
        from: String,
        to: String,
        amount: u64,
        nonce: u64,
    },
}

/// State key for one account.
pub fn account_key(name: &str) -> Vec<u8> {
    format!("acct:{name}").into_bytes()
}

impl TxCommand {
    /// Build an unsigned transaction declaring exactly the keys this command
    /// can touch.
    pub fn into_transaction(self) -> anyhow::Result<Transaction> {
        let writes = match &self {
            TxCommand::Mint { account, .. } => vec![account_key(account)],
            TxCommand::Transfer { from, to, .. } => {
                vec![account_key(from), account_key(to)]
            }
        };
        let payload = serde_json::to_vec(&self)?;
        Ok(Transaction::new(
            AccessKeys {
                reads: Vec::new(),
                writes,
            },
            payload,
            Vec::new(),
        ))
    }
}

/// In-memory account map behind the `StateMachine` contract.
///
/// Durable history lives in the replicated log; the ledger itself is
/// rebuilt by replay or restored from a snapshot on startup.
pub struct Ledger {
    accounts: Mutex<HashMap<String, Account>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger with a genesis balance set. Every node of a deployment must
    /// start from the same genesis for deterministic apply.
    pub fn with_balances(balances: impl IntoIterator<Item = (String, u64)>) -> Self {
        let accounts = balances
            .into_iter()
            .map(|(name, balance)| (name, Account { balance, nonce: 0 }))
            .collect();
        Self {
            accounts: Mutex::new(accounts),
        }
    }

    pub fn balance(&self, name: &str) -> u64 {
        self.accounts
            .lock()
            .expect("ledger lock")
            .get(name)
            .map(|a| a.balance)
            .unwrap_or(0)
    }

    pub fn account(&self, name: &str) -> Option<Account> {
        self.accounts.lock().expect("ledger lock").get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().expect("ledger lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reject(reason: impl Into<String>, touched: AccessKeys) -> TxApply {
        TxApply {
            outcome: TxOutcome::Rejected {
                reason: reason.into(),
            },
            touched,
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for Ledger {
    fn apply(&self, tx: &Transaction) -> TxApply {
        let cmd: TxCommand = match serde_json::from_slice(&tx.payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                return Self::reject(format!("malformed payload: {err}"), AccessKeys::default())
            }
        };

        let mut accounts = self.accounts.lock().expect("ledger lock");
        match cmd {
            TxCommand::Mint { account, amount } => {
                let entry = accounts.entry(account.clone()).or_default();
                let Some(balance) = entry.balance.checked_add(amount) else {
                    return Self::reject(
                        "balance overflow",
                        AccessKeys {
                            reads: vec![account_key(&account)],
                            writes: Vec::new(),
                        },
                    );
                };
                entry.balance = balance;
                TxApply {
                    outcome: TxOutcome::Applied,
                    touched: AccessKeys {
                        reads: Vec::new(),
                        writes: vec![account_key(&account)],
                    },
                }
            }
            TxCommand::Transfer {
                from,
                to,
                amount,
                nonce,
            } => {
                let read_from = AccessKeys {
                    reads: vec![account_key(&from)],
                    writes: Vec::new(),
                };
                let sender = accounts.get(&from).copied().unwrap_or_default();
                if nonce != sender.nonce + 1 {
                    return Self::reject(
                        format!("nonce out of sequence: got {nonce}, want {}", sender.nonce + 1),
                        read_from,
                    );
                }
                if sender.balance < amount {
                    return Self::reject("insufficient balance", read_from);
                }

                if from == to {
                    let entry = accounts.entry(from.clone()).or_default();
                    entry.nonce = nonce;
                    return TxApply {
                        outcome: TxOutcome::Applied,
                        touched: AccessKeys {
                            reads: Vec::new(),
                            writes: vec![account_key(&from)],
                        },
                    };
                }

                let receiver = accounts.get(&to).copied().unwrap_or_default();
                let Some(credited) = receiver.balance.checked_add(amount) else {
                    return Self::reject(
                        "receiver balance overflow",
                        AccessKeys {
                            reads: vec![account_key(&from), account_key(&to)],
                            writes: Vec::new(),
                        },
                    );
                };

                let sender_entry = accounts.entry(from.clone()).or_default();
                sender_entry.balance -= amount;
                sender_entry.nonce = nonce;
                accounts.entry(to.clone()).or_default().balance = credited;

                TxApply {
                    outcome: TxOutcome::Applied,
                    touched: AccessKeys {
                        reads: Vec::new(),
                        writes: vec![account_key(&from), account_key(&to)],
                    },
                }
            }
        }
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let accounts = self.accounts.lock().expect("ledger lock");
        let mut items: Vec<(String, Account)> =
            accounts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(serde_json::to_vec(&items)?)
    }

    fn restore(&self, state: &[u8]) -> anyhow::Result<()> {
        let items: Vec<(String, Account)> = serde_json::from_slice(state)?;
        *self.accounts.lock().expect("ledger lock") = items.into_iter().collect();
        Ok(())
    }

    fn digest(&self) -> [u8; 32] {
        let accounts = self.accounts.lock().expect("ledger lock");
        let mut items: Vec<(&String, &Account)> = accounts.iter().collect();
        items.sort_by(|a, b| a.0.cmp(b.0));
        let mut hasher = blake3::Hasher::new();
        for (name, account) in items {
            hasher.update(&(name.len() as u32).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&account.balance.to_le_bytes());
            hasher.update(&account.nonce.to_le_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: &str, to: &str, amount: u64, nonce: u64) -> Transaction {
        TxCommand::Transfer {
            from: from.into(),
            to: to.into(),
            amount,
            nonce,
        }
        .into_transaction()
        .unwrap()
    }

    #[test]
    fn transfer_moves_funds_and_bumps_nonce() {
        let ledger = Ledger::with_balances([("a".to_string(), 100)]);
        let tx = transfer("a", "b", 30, 1);
        let applied = ledger.apply(&tx);
        assert_eq!(applied.outcome, TxOutcome::Applied);
        assert_eq!(ledger.balance("a"), 70);
        assert_eq!(ledger.balance("b"), 30);
        assert_eq!(ledger.account("a").unwrap().nonce, 1);
        // Touched keys stay within the declaration.
        assert!(tx.access.covers(&applied.touched));
    }

    #[test]
    fn replayed_transfer_is_rejected() {
        let ledger = Ledger::with_balances([("a".to_string(), 100)]);
        let tx = transfer("a", "b", 30, 1);
        assert_eq!(ledger.apply(&tx).outcome, TxOutcome::Applied);
        // Same nonce again: business-level reject, no state change.
        let replay = ledger.apply(&tx);
        assert!(matches!(replay.outcome, TxOutcome::Rejected { .. }));
        assert_eq!(ledger.balance("a"), 70);
        assert_eq!(ledger.balance("b"), 30);
        assert!(tx.access.covers(&replay.touched));
    }

    #[test]
    fn insufficient_balance_rejects_without_mutation() {
        let ledger = Ledger::with_balances([("a".to_string(), 10)]);
        let applied = ledger.apply(&transfer("a", "b", 11, 1));
        assert!(matches!(applied.outcome, TxOutcome::Rejected { .. }));
        assert_eq!(ledger.balance("a"), 10);
        assert_eq!(ledger.account("a").unwrap().nonce, 0);
    }

    #[test]
    fn malformed_payload_rejects() {
        let ledger = Ledger::new();
        let tx = Transaction::new(
            AccessKeys {
                reads: vec![],
                writes: vec![b"acct:a".to_vec()],
            },
            b"not json".to_vec(),
            vec![],
        );
        assert!(matches!(ledger.apply(&tx).outcome, TxOutcome::Rejected { .. }));
    }

    #[test]
    fn mint_credits_account() {
        let ledger = Ledger::new();
        let tx = TxCommand::Mint {
            account: "a".into(),
            amount: 500,
        }
        .into_transaction()
        .unwrap();
        assert_eq!(ledger.apply(&tx).outcome, TxOutcome::Applied);
        assert_eq!(ledger.balance("a"), 500);
    }

    #[test]
    fn snapshot_restore_round_trip_preserves_digest() {
        let ledger = Ledger::with_balances([("a".to_string(), 100), ("b".to_string(), 7)]);
        ledger.apply(&transfer("a", "b", 5, 1));
        let digest = ledger.digest();

        let restored = Ledger::new();
        restored.restore(&ledger.snapshot().unwrap()).unwrap();
        assert_eq!(restored.digest(), digest);
        assert_eq!(restored.balance("a"), 95);
        assert_eq!(restored.account("a").unwrap().nonce, 1);
    }

    #[test]
    fn digest_is_order_independent() {
        let a = Ledger::with_balances([("x".to_string(), 1), ("y".to_string(), 2)]);
        let b = Ledger::with_balances([("y".to_string(), 2), ("x".to_string(), 1)]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), Ledger::new().digest());
    }

    #[test]
    fn self_transfer_only_bumps_nonce() {
        let ledger = Ledger::with_balances([("a".to_string(), 50)]);
        assert_eq!(
            ledger.apply(&transfer("a", "a", 20, 1)).outcome,
            TxOutcome::Applied
        );
        assert_eq!(ledger.balance("a"), 50);
        assert_eq!(ledger.account("a").unwrap().nonce, 1);
    }
}
