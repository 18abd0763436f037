// Content-type detection from file names and upstream headers.

pub mod mime;
