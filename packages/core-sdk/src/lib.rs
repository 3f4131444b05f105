pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod llm;
pub mod models;
pub mod proxy;
pub mod recovery;
pub mod saliency;
pub mod server;
pub mod sse;
pub mod story;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::classify;
    pub use crate::config;
    pub use crate::db;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::recovery;
    pub use crate::saliency;
    pub use crate::server;
    pub use crate::telemetry;
}
