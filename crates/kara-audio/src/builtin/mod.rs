//! Built-in processors backing the permanent graph nodes.
//!
//! Each one implements [`kara_node::Processor`] just like the effects, so the
//! render chain runs sources, gates, effects and sinks the same way.

pub mod gate;
pub mod io;
pub mod mixer;
pub mod player;

pub use gate::GateProcessor;
pub use io::{InputProcessor, OutputProcessor};
pub use mixer::{MixerProcessor, MixerSettings};
pub use player::{PlayerHandle, PlayerProcessor, Transport};
