mod follow;
mod midi_importer;
mod model;
mod onset;
mod player;
mod stream;
mod synth;
mod tempo_map;
mod util;

pub use follow::*;
pub use midi_importer::*;
pub use model::config::*;
pub use model::song::*;
pub use onset::*;
pub use player::*;
pub use stream::*;
pub use synth::*;
pub use tempo_map::*;
pub use util::*;
