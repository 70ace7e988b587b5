//! メタデータストアのデータアクセス層。
//!
//! エンティティごとのトレイトと、PostgreSQL / インメモリの2実装を提供する。

pub mod memory;
pub mod postgres;
mod traits;

pub use memory::InMemoryDao;
pub use postgres::PgRepurposeDao;
pub use traits::{ContentDao, FailureDao, GenerationDao, RepurposeDao, StyleDao};
