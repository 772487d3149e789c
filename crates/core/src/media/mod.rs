//! Collaborators around the core: frame decoding, mask loading and video encoding.

pub mod images;
pub mod masks;
pub mod video_input;
pub mod video_output;
