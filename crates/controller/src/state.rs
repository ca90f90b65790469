use crate::store::Store;

/// Shared handler state: the store plus the optional static bearer token
/// required on API calls (None disables auth, for development and tests).
pub struct AppState {
    pub store: Store,
    pub access_token: Option<String>,
}
