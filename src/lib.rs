pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod events;
pub mod links;
pub mod lookup;
pub mod pixel;
pub mod report;
pub mod server;
pub mod signals;
pub mod store;
pub mod suspicion;
pub mod token;

pub use aggregator::{EventAggregator, ReportRow};
pub use classifier::{Classification, OpenClassifier, OpenLabel};
pub use config::Config;
pub use events::{ClickEvent, OpenEvent};
pub use server::{router, serve, AppState};
pub use store::EventStore;
pub use suspicion::{OpenAttempt, SuspicionCondition, SuspicionEvaluator, SuspicionVerdict};
