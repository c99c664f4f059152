pub mod atom_feed;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod handles;
pub mod monitor;
pub mod notify;
pub mod registry;
pub mod source;
pub mod store;
pub mod youtube;

pub use atom_feed::AtomFeedClient;
pub use cache::TtlCache;
pub use channel::{ChannelRef, FeedItem, Health, NotificationEvent, WatchedChannel};
pub use config::{Config, SourceKind};
pub use error::{ConfigError, DispatchError, MonitorError, RegistryError, ResolveError, StoreError, UpstreamError};
pub use handles::HandleBook;
pub use monitor::{ChannelOutcome, CycleReport, ItemCache, Monitor, MonitorConfig, MonitorHandle};
pub use notify::{ChannelDispatcher, Dispatcher, EmailDispatcher, FanOutDispatcher, LogDispatcher, WebhookDispatcher};
pub use registry::{ChannelListing, Registry};
pub use source::FeedSource;
pub use store::{Access, ChannelStore, PollRecord};
pub use youtube::YouTubeApiClient;
