pub mod domain;
pub mod pipeline;
pub mod template;
pub mod traits;
