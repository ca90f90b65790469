//! Typed REST client for the controller API, used by agents and tooling.

use reqwest::{Client, RequestBuilder};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{
    Agent, AgentRegistration, AgentUpdate, Session, SessionRequirements,
};

pub struct ControllerClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl ControllerClient {
    /// `base_url` is scheme + authority, e.g. `http://controller:43210`.
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Error> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }
        Ok(response.json().await?)
    }

    async fn expect_ok(response: reqwest::Response) -> Result<(), Error> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }
        Ok(())
    }

    pub async fn register_agent(&self, registration: &AgentRegistration) -> Result<Uuid, Error> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/agents", self.base_url)))
            .json(registration)
            .send()
            .await?;
        #[derive(serde::Deserialize)]
        struct Registered {
            id: Uuid,
        }
        Ok(Self::expect_json::<Registered>(response).await?.id)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent, Error> {
        let response = self
            .authorize(self.client.get(format!("{}/v1/agents/{}", self.base_url, id)))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    pub async fn update_agent(&self, update: &AgentUpdate) -> Result<(), Error> {
        let response = self
            .authorize(self.client.put(format!("{}/v1/agents/{}", self.base_url, update.id)))
            .json(update)
            .send()
            .await?;
        Self::expect_ok(response).await
    }

    pub async fn request_session(
        &self,
        requirements: &SessionRequirements,
    ) -> Result<Uuid, Error> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/sessions", self.base_url)))
            .json(requirements)
            .send()
            .await?;
        #[derive(serde::Deserialize)]
        struct Requested {
            id: Uuid,
        }
        Ok(Self::expect_json::<Requested>(response).await?.id)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Session, Error> {
        let response = self
            .authorize(self.client.get(format!("{}/v1/sessions/{}", self.base_url, id)))
            .send()
            .await?;
        Self::expect_json(response).await
    }

    pub async fn cancel_session(&self, id: Uuid) -> Result<(), Error> {
        let response = self
            .authorize(self.client.delete(format!("{}/v1/sessions/{}", self.base_url, id)))
            .send()
            .await?;
        Self::expect_ok(response).await
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = ControllerClient::new("http://controller:43210/", None);
        assert_eq!(client.base_url(), "http://controller:43210");
    }
}
