use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rocksdb::{Direction, IteratorMode, Options, DB};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{Device, DeviceSummary, Position};

use std::str;

/// Nonces for the (out-of-core) login redirect flow live for five minutes.
const NONCE_TTL_SECS: i64 = 300;

pub struct DBLayer {
    db: DB,
    // "take pending" is a read-then-delete that must be atomic per device;
    // a single async mutex serializes every pending-slot mutation.
    pending_lock: Mutex<()>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PendingSlot {
    queued_ts: i64,
    envelope: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct NonceRow {
    val: String,
    created_ts: i64,
}

impl DBLayer {
    pub fn new(path: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            pending_lock: Mutex::new(()),
        })
    }

    // ============================================================
    // DEVICE RECORDS
    // ============================================================
    fn device_key(device_id: &str) -> String {
        format!("device:{device_id}")
    }

    fn user_device_key(user_id: &str, device_id: &str) -> String {
        format!("user_device:{user_id}:{device_id}")
    }

    fn pending_prefix(device_id: &str) -> String {
        format!("pending:{device_id}:")
    }

    fn pending_key(device_id: &str, code: char) -> String {
        format!("{}{}", Self::pending_prefix(device_id), code)
    }

    fn position_key(device_id: &str) -> String {
        format!("position:{device_id}")
    }

    /// Insert or update a device record and its owner index.
    pub async fn register_device(&self, device: &Device) -> Result<()> {
        let key = Self::device_key(&device.id);

        // A device that changed hands must not stay on the old user's index.
        let previous: Option<Device> = self
            .db
            .get(&key)?
            .map(|val| serde_json::from_slice::<Device>(&val))
            .transpose()?;
        if let Some(prev) = previous {
            if prev.user_id != device.user_id {
                self.db
                    .delete(Self::user_device_key(&prev.user_id, &prev.id))?;
            }
        }

        self.db.put(&key, serde_json::to_vec(device)?)?;
        self.db.put(
            Self::user_device_key(&device.user_id, &device.id),
            device.id.as_bytes(),
        )?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let key = Self::device_key(device_id);
        self.db
            .get(key)?
            .map(|v| serde_json::from_slice(&v).map_err(Into::into))
            .transpose()
    }

    pub async fn list_devices_for_user(&self, user_id: &str) -> Result<Vec<DeviceSummary>> {
        let prefix = format!("user_device:{user_id}:");
        let mut out = Vec::new();

        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(&prefix) {
                break;
            }
            let device_id = str::from_utf8(&val)?;
            if let Some(device) = self.get_device(device_id).await? {
                out.push(DeviceSummary {
                    id: device.id,
                    name: device.name,
                });
            }
        }
        Ok(out)
    }

    /// Update the last-exchange timestamp for a device.
    pub async fn touch(&self, device_id: &str) -> Result<()> {
        let key = Self::device_key(device_id);
        if let Some(val) = self.db.get(&key)? {
            let mut device: Device = serde_json::from_slice(&val)?;
            device.last_exchange = chrono::Utc::now().timestamp();
            self.db.put(&key, serde_json::to_vec(&device)?)?;
        }
        Ok(())
    }

    pub async fn set_device_lock(&self, device_id: &str, has_passcode: bool) -> Result<()> {
        let key = Self::device_key(device_id);
        if let Some(val) = self.db.get(&key)? {
            let mut device: Device = serde_json::from_slice(&val)?;
            device.has_passcode = has_passcode;
            device.last_exchange = chrono::Utc::now().timestamp();
            self.db.put(&key, serde_json::to_vec(&device)?)?;
        }
        Ok(())
    }

    /// Record the device's position. Only the latest fix is retained, so this
    /// overwrites rather than appends.
    pub async fn set_device_location(&self, device_id: &str, position: &Position) -> Result<()> {
        self.db
            .put(Self::position_key(device_id), serde_json::to_vec(position)?)?;
        Ok(())
    }

    pub async fn get_position(&self, device_id: &str) -> Result<Option<Position>> {
        self.db
            .get(Self::position_key(device_id))?
            .map(|v| serde_json::from_slice(&v).map_err(Into::into))
            .transpose()
    }

    /// Remove every trace of a device: record, owner index, pending slots
    /// and position.
    pub async fn delete_device(&self, device_id: &str) -> Result<()> {
        let _guard = self.pending_lock.lock().await;

        if let Some(device) = self.get_device(device_id).await? {
            self.db
                .delete(Self::user_device_key(&device.user_id, device_id))?;
        }
        self.db.delete(Self::device_key(device_id))?;
        self.db.delete(Self::position_key(device_id))?;

        let prefix = Self::pending_prefix(device_id);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, _) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        for key in keys {
            self.db.delete(key)?;
        }
        Ok(())
    }

    // ============================================================
    // PENDING COMMAND SLOTS
    // ============================================================

    /// Store a command for a device. One slot per command code: queuing the
    /// same code twice keeps only the newest envelope.
    pub async fn store_command(&self, device_id: &str, code: char, envelope: &str) -> Result<()> {
        let _guard = self.pending_lock.lock().await;
        let slot = PendingSlot {
            queued_ts: chrono::Utc::now().timestamp_millis(),
            envelope: envelope.to_string(),
        };
        self.db.put(
            Self::pending_key(device_id, code),
            serde_json::to_vec(&slot)?,
        )?;
        Ok(())
    }

    /// Take (read and delete) the oldest pending command for a device, if
    /// any. Atomic per device id so a command is delivered exactly once.
    pub async fn take_pending(&self, device_id: &str) -> Result<Option<String>> {
        let guard = self.pending_lock.lock().await;

        let prefix = Self::pending_prefix(device_id);
        let mut oldest: Option<(Box<[u8]>, PendingSlot)> = None;

        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(&prefix) {
                break;
            }
            let slot: PendingSlot = serde_json::from_slice(&val)?;
            match &oldest {
                Some((_, held)) if held.queued_ts <= slot.queued_ts => {}
                _ => oldest = Some((key, slot)),
            }
        }

        let Some((key, slot)) = oldest else {
            return Ok(None);
        };
        self.db.delete(key)?;
        drop(guard);

        self.touch(device_id).await?;
        Ok(Some(slot.envelope))
    }

    // ============================================================
    // LOGIN-FLOW NONCES
    // ============================================================
    fn nonce_key(key: &str) -> String {
        format!("nonce:{key}")
    }

    fn nonce_sig(key: &str, val: &str) -> String {
        let digest = Sha256::digest(format!("{key}.{val}").as_bytes());
        BASE64.encode(digest)
    }

    /// Mint a single-use nonce, returned as "key.signature".
    pub async fn get_nonce(&self) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        let val = Uuid::new_v4().to_string();
        let row = NonceRow {
            val: val.clone(),
            created_ts: chrono::Utc::now().timestamp(),
        };
        self.db
            .put(Self::nonce_key(&key), serde_json::to_vec(&row)?)?;
        Ok(format!("{}.{}", key, Self::nonce_sig(&key, &val)))
    }

    /// Consume and verify a nonce. Each nonce checks at most once, and only
    /// within its TTL.
    pub async fn check_nonce(&self, nonce: &str) -> Result<bool> {
        self.gc_nonces()?;

        let Some((key, sig)) = nonce.split_once('.') else {
            tracing::warn!(nonce, "invalid nonce");
            return Ok(false);
        };

        let db_key = Self::nonce_key(key);
        let Some(val) = self.db.get(&db_key)? else {
            return Ok(false);
        };
        // Single use: gone the moment it is read.
        self.db.delete(&db_key)?;

        let row: NonceRow = serde_json::from_slice(&val)?;
        Ok(Self::nonce_sig(key, &row.val) == sig)
    }

    fn gc_nonces(&self) -> Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - NONCE_TTL_SECS;
        let prefix = "nonce:";
        let mut expired = Vec::new();

        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(prefix) {
                break;
            }
            let row: NonceRow = serde_json::from_slice(&val)?;
            if row.created_ts < cutoff {
                expired.push(key);
            }
        }
        for key in expired {
            self.db.delete(key)?;
        }
        Ok(())
    }
}
