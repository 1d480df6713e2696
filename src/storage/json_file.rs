use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::models::{BankConnection, Id, Transaction, User};

use super::{latest_by_date, sort_newest_first, SaveOutcome, Storage, TransactionFilter};

/// JSON file-based storage implementation.
///
/// Directory structure:
/// ```text
/// data/
///   users/
///     {id}/user.json
///   connections/
///     {id}/connection.json
///   accounts/
///     {account}/transactions.jsonl
/// ```
///
/// Provider account ids that are not safe path segments are hashed into a
/// stable directory name. Transaction id uniqueness is enforced through an
/// in-process index built from disk on first use.
pub struct JsonFileStorage {
    base_path: PathBuf,
    transaction_ids: Mutex<Option<HashSet<String>>>,
}

impl JsonFileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            transaction_ids: Mutex::new(None),
        }
    }

    fn users_dir(&self) -> PathBuf {
        self.base_path.join("users")
    }

    fn connections_dir(&self) -> PathBuf {
        self.base_path.join("connections")
    }

    fn accounts_dir(&self) -> PathBuf {
        self.base_path.join("accounts")
    }

    fn user_file(&self, id: &Id) -> Result<PathBuf> {
        let id = Id::from_string_checked(id.as_str())?;
        Ok(self.users_dir().join(id.as_str()).join("user.json"))
    }

    fn connection_file(&self, id: &Id) -> Result<PathBuf> {
        let id = Id::from_string_checked(id.as_str())?;
        Ok(self.connections_dir().join(id.as_str()).join("connection.json"))
    }

    fn transactions_file(&self, account_id: &str) -> PathBuf {
        let dir = match Id::from_string_checked(account_id) {
            Ok(id) => id,
            Err(_) => Id::from_external(account_id),
        };
        self.accounts_dir().join(dir.as_str()).join("transactions.jsonl")
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }

    async fn read_json<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => {
                let value = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse JSON from {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_dir(path).await?;
        let content = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn read_jsonl<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Vec<T>> {
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
        };

        let mut lines = BufReader::new(file).lines();
        let mut items = Vec::new();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.trim().is_empty() {
                continue;
            }
            let item: T = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSONL line in {}", path.display()))?;
            items.push(item);
        }

        Ok(items)
    }

    async fn append_jsonl<T: serde::Serialize>(&self, path: &Path, item: &T) -> Result<()> {
        self.ensure_dir(path).await?;

        let mut line = serde_json::to_string(item).context("Failed to serialize item")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open {} for append", path.display()))?;
        // One write per row so a crash never leaves half a record followed by a newline.
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();

        let mut entries = match fs::read_dir(path).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        while let Some(entry) = entries.next_entry().await.context("Failed to read entry")? {
            if let Ok(file_type) = entry.file_type().await {
                if file_type.is_dir() {
                    dirs.push(entry.path());
                }
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    async fn all_transactions(&self) -> Result<Vec<Transaction>> {
        let mut all = Vec::new();
        for dir in self.list_dirs(&self.accounts_dir()).await? {
            let rows: Vec<Transaction> = self.read_jsonl(&dir.join("transactions.jsonl")).await?;
            all.extend(rows);
        }
        Ok(all)
    }

    async fn list_connections(&self) -> Result<Vec<BankConnection>> {
        let mut connections = Vec::new();
        for dir in self.list_dirs(&self.connections_dir()).await? {
            if let Some(conn) = self.read_json(&dir.join("connection.json")).await? {
                connections.push(conn);
            }
        }
        Ok(connections)
    }

    async fn load_index(&self) -> Result<HashSet<String>> {
        let ids = self
            .all_transactions()
            .await?
            .into_iter()
            .map(|tx| tx.transaction_id)
            .collect();
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl Storage for JsonFileStorage {
    async fn get_user(&self, id: &Id) -> Result<Option<User>> {
        self.read_json(&self.user_file(id)?).await
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.write_json(&self.user_file(&user.id)?, user).await
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for dir in self.list_dirs(&self.users_dir()).await? {
            if let Some(user) = self.read_json::<User>(&dir.join("user.json")).await? {
                users.push(user);
            }
        }
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(users)
    }

    async fn get_connection(&self, id: &Id) -> Result<Option<BankConnection>> {
        self.read_json(&self.connection_file(id)?).await
    }

    async fn save_connection(&self, connection: &BankConnection) -> Result<()> {
        let clash = self.list_connections().await?.into_iter().any(|existing| {
            existing.id != connection.id && existing.requisition_id == connection.requisition_id
        });
        if clash {
            anyhow::bail!(
                "Requisition {} is already attached to another connection",
                connection.requisition_id
            );
        }
        self.write_json(&self.connection_file(&connection.id)?, connection)
            .await
    }

    async fn connections_for_user(&self, user_id: &Id) -> Result<Vec<BankConnection>> {
        let mut owned: Vec<BankConnection> = self
            .list_connections()
            .await?
            .into_iter()
            .filter(|c| &c.user_id == user_id)
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(owned)
    }

    async fn find_connection_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<BankConnection>> {
        Ok(self
            .list_connections()
            .await?
            .into_iter()
            .find(|c| c.reference == reference))
    }

    async fn existing_transaction_ids(&self, candidate_ids: &[String]) -> Result<Vec<String>> {
        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.transaction_ids.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await?);
        }
        let index = guard.get_or_insert_with(HashSet::new);
        Ok(candidate_ids
            .iter()
            .filter(|id| index.contains(id.as_str()))
            .cloned()
            .collect())
    }

    async fn save_transaction(&self, transaction: &Transaction) -> Result<SaveOutcome> {
        let mut guard = self.transaction_ids.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await?);
        }
        let index = guard.get_or_insert_with(HashSet::new);

        if index.contains(&transaction.transaction_id) {
            return Ok(SaveOutcome::Duplicate);
        }

        self.append_jsonl(&self.transactions_file(&transaction.account_id), transaction)
            .await?;
        index.insert(transaction.transaction_id.clone());
        Ok(SaveOutcome::Inserted)
    }

    async fn most_recent_transaction(&self, account_id: &str) -> Result<Option<Transaction>> {
        let rows = self.transactions_for_account(account_id).await?;
        Ok(latest_by_date(&rows).cloned())
    }

    async fn transactions_for_account(&self, account_id: &str) -> Result<Vec<Transaction>> {
        self.read_jsonl(&self.transactions_file(account_id)).await
    }

    async fn transactions_for_user(
        &self,
        user_id: &Id,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        let connection_ids: HashSet<Id> = self
            .connections_for_user(user_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut rows: Vec<Transaction> = self
            .all_transactions()
            .await?
            .into_iter()
            .filter(|tx| connection_ids.contains(&tx.connection_id) && filter.matches(tx))
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }
}
