pub mod errors;
pub mod events;
pub mod ids;
pub mod prompt;
pub mod provider;
pub mod repository;
pub mod stream;

pub use errors::{GatewayError, RepositoryError};
pub use events::{ErrorCode, StreamEvent};
pub use ids::{CharacterId, SessionId, SessionKey, TurnId, UserId};
pub use prompt::{PromptPart, PromptSection, PromptStack, Role, SectionKind};
pub use provider::{ChunkStream, GenerateOptions, GenerationClient};
pub use repository::{TurnRepository, UnitOfWork};
pub use stream::{Chunk, Generation, Pricing, Usage};
