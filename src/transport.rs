use std::io::{Read, Write};

/// Byte pipe to one device. The serial port, and anything else that reads and
/// writes, qualifies.
pub trait Transport: Read + Write {}

impl<T: Read + Write + ?Sized> Transport for T {}
