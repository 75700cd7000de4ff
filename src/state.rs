use crate::api::ChatClient;
use crate::chat::ChatService;
use crate::storage::StorageManager;

// Core application state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    // The pool and the API client are shared process-wide; the store's own
    // transactions are the only coordination between requests.
    pub chat: ChatService,
}

impl AppState {
    pub fn new(storage: StorageManager, client: ChatClient) -> Self {
        Self {
            chat: ChatService::new(storage, client),
        }
    }
}
