//! Keyed, per-user views over the secure and insecure storage backends.
//!
//! The two backends are distinct types: a [`SecureStorage`] can never be passed where an
//! [`InsecureStorage`] is expected. Secure storage holds tokens and correlation state.
//! Insecure storage holds data safe to expose to other scripts, such as redirect URLs.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use smol_str::SmolStr;
use solid_authn_common::Storage;
use tokio::sync::Mutex;

use crate::error::{AuthError, Result};
use crate::types::OidcContext;

/// Per-user blob key.
pub fn user_key(user_id: &str) -> String {
    format!("solidClientAuthenticationUser:{user_id}")
}

#[derive(Debug, Clone, Copy)]
pub enum Secure {}

#[derive(Debug, Clone, Copy)]
pub enum Insecure {}

pub type SecureStorage = KeyedStorage<Secure>;
pub type InsecureStorage = KeyedStorage<Insecure>;

/// Field map stored for one user id.
pub type UserData = BTreeMap<String, String>;

/// One backend plus the per-user blob helpers.
///
/// Every call round-trips the backend; nothing is cached.
pub struct KeyedStorage<M> {
    backend: Arc<dyn Storage>,
    // serializes read-modify-write of user blobs
    write_lock: Arc<Mutex<()>>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for KeyedStorage<M> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            write_lock: self.write_lock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> KeyedStorage<M> {
    pub fn new(backend: impl Storage + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Storage>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.backend.get(key).await?)
    }

    /// Like [`get`](Self::get), but absence is a `NotStored` error.
    pub async fn get_required(&self, key: &str) -> Result<String> {
        self.get(key)
            .await?
            .ok_or_else(|| AuthError::not_stored(smol_str::format_smolstr!("[{key}] is not stored")))
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        Ok(self.backend.set(key, value.into()).await?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        Ok(self.backend.delete(key).await?)
    }

    /// Read-modify-write of a plain key under the write lock. `f` sees the current value
    /// and returns the replacement, or `None` to leave the key untouched.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(Option<String>) -> Result<Option<String>> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.backend.get(key).await?;
        if let Some(next) = f(current)? {
            self.backend.set(key, next).await?;
        }
        Ok(())
    }

    /// Whole blob for `user_id`. A blob that fails to parse reads as empty and is
    /// overwritten by the next write.
    pub async fn get_user_data(&self, user_id: &str) -> Result<UserData> {
        let Some(raw) = self.backend.get(&user_key(user_id)).await? else {
            return Ok(UserData::new());
        };
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw) {
            Ok(map) => Ok(map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    serde_json::Value::String(s) => Some((k, s)),
                    serde_json::Value::Bool(b) => Some((k, b.to_string())),
                    serde_json::Value::Number(n) => Some((k, n.to_string())),
                    _ => None,
                })
                .collect()),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(user_id, error = %_e, "discarding unparseable user data");
                Ok(UserData::new())
            }
        }
    }

    pub async fn get_for_user(&self, user_id: &str, field: &str) -> Result<Option<String>> {
        Ok(self.get_user_data(user_id).await?.remove(field))
    }

    /// Like [`get_for_user`](Self::get_for_user), but absence is a `NotStored` error.
    pub async fn get_for_user_required(&self, user_id: &str, field: &str) -> Result<String> {
        self.get_for_user(user_id, field).await?.ok_or_else(|| {
            AuthError::not_stored(smol_str::format_smolstr!(
                "Field [{field}] for user [{user_id}] is not stored"
            ))
        })
    }

    /// Merge `values` into the user's blob.
    pub async fn set_for_user<I, K, V>(&self, user_id: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let _guard = self.write_lock.lock().await;
        let mut data = self.get_user_data(user_id).await?;
        data.extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        self.write_user_data(user_id, &data).await
    }

    /// Remove one field; sibling fields are kept.
    pub async fn delete_for_user(&self, user_id: &str, field: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.get_user_data(user_id).await?;
        if data.remove(field).is_some() {
            self.write_user_data(user_id, &data).await?;
        }
        Ok(())
    }

    /// Read a field and delete it in the same critical section.
    pub async fn take_for_user(&self, user_id: &str, field: &str) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.get_user_data(user_id).await?;
        let value = data.remove(field);
        if value.is_some() {
            self.write_user_data(user_id, &data).await?;
        }
        Ok(value)
    }

    pub async fn delete_all_user_data(&self, user_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Ok(self.backend.delete(&user_key(user_id)).await?)
    }

    async fn write_user_data(&self, user_id: &str, data: &UserData) -> Result<()> {
        let raw = serde_json::to_string(data)?;
        Ok(self.backend.set(&user_key(user_id), raw).await?)
    }
}

/// Both backends together.
#[derive(Clone)]
pub struct StorageUtility {
    secure: SecureStorage,
    insecure: InsecureStorage,
}

impl StorageUtility {
    pub fn new(secure: impl Storage + 'static, insecure: impl Storage + 'static) -> Self {
        Self {
            secure: SecureStorage::new(secure),
            insecure: InsecureStorage::new(insecure),
        }
    }

    pub fn from_parts(secure: SecureStorage, insecure: InsecureStorage) -> Self {
        Self { secure, insecure }
    }

    pub fn secure(&self) -> &SecureStorage {
        &self.secure
    }

    pub fn insecure(&self) -> &InsecureStorage {
        &self.insecure
    }

    /// Correlation state recorded for `session_id` when login started.
    ///
    /// Reading does not consume the code verifier; see [`KeyedStorage::take_for_user`].
    pub async fn load_oidc_context(&self, session_id: &str) -> Result<OidcContext> {
        let mut data = self.secure.get_user_data(session_id).await?;
        let Some(issuer) = data.remove("issuer") else {
            return Err(AuthError::missing_context(smol_str::format_smolstr!(
                "Failed to retrieve OIDC context from storage associated with session [{session_id}]"
            )));
        };
        Ok(OidcContext {
            issuer: issuer.into(),
            code_verifier: data.remove("codeVerifier").map(SmolStr::from),
            redirect_url: data.remove("redirectUrl").map(SmolStr::from),
            dpop: data.remove("dpop").as_deref() == Some("true"),
        })
    }
}

/// Storage keys the crate owns outside of user blobs.
pub(crate) fn issuer_config_key(issuer: &str) -> SmolStr {
    smol_str::format_smolstr!("issuerConfig:{issuer}")
}

pub(crate) fn registered_sessions_key() -> SmolStr {
    smol_str::format_smolstr!("{}registeredSessions", crate::KEY_PREFIX)
}
