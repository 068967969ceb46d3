pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod navigation;
pub mod sessions;
pub mod stream;
pub mod upload;
pub mod view;

pub use api::{ChatApi, HttpChatApi};
pub use config::ClientConfig;
pub use controller::{ConversationController, SubmitOutcome};
pub use error::{ChatError, Result};
pub use navigation::{MemoryNavigator, Navigator, Route};
pub use sessions::{SessionList, SessionStore};
pub use stream::{Completion, ReplyDecoder, StreamRecord};
pub use upload::UploadCoordinator;
pub use view::{ControllerEvent, ConversationMessage, ConversationView, Delivery, Phase};
