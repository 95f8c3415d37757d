use anyhow::Result;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::time::Duration;

use crate::cli::SerialOpts;

/// Opens the device port. Reads time out quickly so the dispatcher can check
/// its reply deadline and stop requests between attempts.
pub fn open_port(opts: &SerialOpts) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(&opts.dev, opts.baud)
        .timeout(Duration::from_millis(50))
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(if opts.rtscts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        });

    let port = builder
        .open()
        .map_err(|e| anyhow::anyhow!("open {}: {}", opts.dev, e))?;
    // Stale bytes from an earlier run would be read as the start of the
    // first reply frame; the decoder has no way to resynchronise past them.
    port.clear(serialport::ClearBuffer::All)?;
    Ok(port)
}
