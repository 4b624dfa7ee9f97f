pub mod acf;
pub mod codec;
pub mod pcx;
pub mod vue;

pub use acf::{
    AcfFile, AcfFormat, AcfFrame, AcfFrameView, AcfSummary, FrameKind, FrameLenInfo, Palette,
    map_input, parse_acf,
};
pub use codec::{DecodeStatus, FrameDecoder, FrameOutcome};
pub use pcx::{save_pcx, write_pcx};
pub use vue::{CameraRecord, render_vue};
