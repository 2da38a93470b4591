pub mod canvas;
pub mod card;
pub mod chrome;
pub mod correction;
pub mod encoding;
pub mod error;
pub mod fonts;
pub mod pipeline;
pub mod request;
pub mod resources;
pub mod snapshot;
pub mod template;
pub mod usage;
