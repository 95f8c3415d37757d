use anyhow::{Context, Result};

use npu_link::cancel::CancelToken;
use npu_link::dispatch::Dispatcher;

use crate::cli::{ResetOpts, StatusOpts};
use crate::port::open_port;

pub fn run(opts: StatusOpts, cancel: CancelToken) -> Result<()> {
    let port = open_port(&opts.ser)?;
    let mut dev = Dispatcher::new(port, opts.link.to_config()).with_cancel(cancel);
    let st = dev.system_status().context("system status")?;
    let kn = dev.kn_number().context("kn number")?;
    println!(
        "firmware=0x{:08X} build={} sys=0x{:04X} app=0x{:04X} kn=0x{:08X}",
        st.firmware_id, st.build_id, st.sys_status, st.app_status, kn
    );
    Ok(())
}

pub fn reset(opts: ResetOpts, cancel: CancelToken) -> Result<()> {
    let port = open_port(&opts.ser)?;
    let mut dev = Dispatcher::new(port, opts.link.to_config()).with_cancel(cancel);
    dev.reset(opts.mode, opts.check_code)
        .with_context(|| format!("reset mode {}", opts.mode))?;
    Ok(())
}
