use smol_str::SmolStr;

use crate::{
    error::Result,
    storage::{StorageUtility, registered_sessions_key},
    types::{SessionInfo, TokenType},
};

/// Reads and clears session state spread across the two storage backends.
#[derive(Clone)]
pub struct SessionInfoManager {
    storage: StorageUtility,
}

impl SessionInfoManager {
    pub fn new(storage: StorageUtility) -> Self {
        Self { storage }
    }

    /// Session assembled from stored fields, or `None` if nothing is stored for it.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let mut secure = self.storage.secure().get_user_data(session_id).await?;
        let mut insecure = self.storage.insecure().get_user_data(session_id).await?;

        let is_logged_in = secure.remove("isLoggedIn");
        let web_id = secure.remove("webId");
        let refresh_token = secure.remove("refreshToken");
        let client_id = insecure.remove("clientId");
        let id_token = insecure.remove("idToken");
        if is_logged_in.is_none()
            && web_id.is_none()
            && refresh_token.is_none()
            && client_id.is_none()
            && id_token.is_none()
        {
            return Ok(None);
        }

        Ok(Some(SessionInfo {
            session_id: session_id.into(),
            is_logged_in: is_logged_in.as_deref() == Some("true"),
            web_id: web_id.map(SmolStr::from),
            issuer: insecure.remove("issuer").map(SmolStr::from),
            client_app_id: client_id.map(SmolStr::from),
            client_app_secret: insecure.remove("clientSecret").map(SmolStr::from),
            refresh_token: refresh_token.map(SmolStr::from),
            redirect_url: insecure.remove("redirectUrl").map(SmolStr::from),
            id_token: id_token.map(SmolStr::from),
            token_type: secure
                .remove("tokenType")
                .and_then(|t| t.parse::<TokenType>().ok()),
            expiration_date: secure.remove("expirationDate").and_then(|d| d.parse().ok()),
        }))
    }

    /// Every registered session that still has stored state.
    pub async fn get_all(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for id in self.get_registered_session_ids().await? {
            if let Some(info) = self.get(&id).await? {
                sessions.push(info);
            }
        }
        Ok(sessions)
    }

    /// Drop everything stored for `session_id` in both backends.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        self.storage.secure().delete_all_user_data(session_id).await?;
        self.storage.insecure().delete_all_user_data(session_id).await?;
        self.unregister(session_id).await
    }

    /// Keep the session's identity fields but mark it logged out and forget its tokens.
    pub async fn set_logged_out(&self, session_id: &str) -> Result<()> {
        let secure = self.storage.secure();
        secure.delete_for_user(session_id, "refreshToken").await?;
        secure
            .set_for_user(session_id, [("isLoggedIn", "false")])
            .await?;
        self.storage
            .insecure()
            .delete_for_user(session_id, "idToken")
            .await
    }

    pub async fn register(&self, session_id: &str) -> Result<()> {
        self.update_registered(|ids| {
            if ids.iter().any(|id| id == session_id) {
                return false;
            }
            ids.push(session_id.into());
            true
        })
        .await
    }

    pub async fn get_registered_session_ids(&self) -> Result<Vec<SmolStr>> {
        let raw = self.storage.secure().get(&registered_sessions_key()).await?;
        Ok(parse_registered(raw))
    }

    async fn unregister(&self, session_id: &str) -> Result<()> {
        self.update_registered(|ids| {
            let before = ids.len();
            ids.retain(|id| id != session_id);
            ids.len() != before
        })
        .await
    }

    /// Apply `edit` to the registered id list atomically; it returns whether it changed
    /// anything.
    async fn update_registered<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<SmolStr>) -> bool + Send,
    {
        self.storage
            .secure()
            .update(&registered_sessions_key(), |raw| {
                let mut ids = parse_registered(raw);
                if !edit(&mut ids) {
                    return Ok(None);
                }
                Ok(Some(serde_json::to_string(&ids)?))
            })
            .await
    }
}

fn parse_registered(raw: Option<String>) -> Vec<SmolStr> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
