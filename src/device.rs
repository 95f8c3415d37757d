//! Device-level operations that sit outside the two pipelines.

use tracing::{error, info};

use crate::dispatch::Dispatcher;
use crate::error::{LinkError, Result};
use crate::proto::message::{self, RESET_END_MODE, SystemStatus};
use crate::transport::Transport;

impl<T: Transport> Dispatcher<T> {
    pub fn reset(&mut self, mode: u32, check_code: u32) -> Result<()> {
        self.execute(&message::reset(mode, check_code))?;
        info!(mode, "device reset");
        Ok(())
    }

    pub fn system_status(&mut self) -> Result<SystemStatus> {
        let rsp = self.execute(&message::system_status())?;
        message::system_status_reply(&rsp)
    }

    pub fn kn_number(&mut self) -> Result<u32> {
        Ok(self.execute(&message::kn_number())?.status_or_param1)
    }

    /// Loads a model for session execution. The device echoes the size it
    /// accepted.
    pub fn dme_start(&mut self, model: &[u8], fw_info: &[u8]) -> Result<()> {
        let rsp = self.execute(&message::dme_start(model, fw_info))?;
        let accepted = rsp.param2 as usize;
        if accepted != model.len() {
            error!(sent = model.len(), accepted, "model size not echoed");
            return Err(LinkError::violation(format!(
                "device accepted {accepted} of {} model bytes",
                model.len()
            )));
        }
        info!(model = model.len(), fw_info = fw_info.len(), "model loaded");
        Ok(())
    }

    /// Applies a session configuration and returns the model id to run.
    pub fn dme_configure(&mut self, config: &[u8]) -> Result<u16> {
        let rsp = self.execute(&message::dme_config(config))?;
        let model_id = u16::try_from(rsp.param2)
            .map_err(|_| LinkError::violation(format!("model id {} out of range", rsp.param2)))?;
        info!(model_id, "session mode configured");
        Ok(model_id)
    }

    /// Leaves streaming or session mode.
    pub fn end_mode(&mut self) -> Result<()> {
        self.reset(RESET_END_MODE, 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch::Dispatcher;
    use crate::error::LinkError;
    use crate::proto::command::Command;
    use crate::sim::{Event, SimDevice};

    #[test]
    fn status_and_identity() {
        let mut d = Dispatcher::new(SimDevice::new(), SimDevice::test_config());
        let st = d.system_status().unwrap();
        assert_eq!(st.firmware_id, SimDevice::FIRMWARE_ID);
        assert_eq!(st.build_id, 42);
        assert_eq!(d.kn_number().unwrap(), 0x520);
    }

    #[test]
    fn model_load_and_configure() {
        let mut d = Dispatcher::new(SimDevice::new(), SimDevice::test_config());
        let model = vec![0xAB; 300];
        d.dme_start(&model, &[1, 2, 3, 4]).unwrap();
        assert_eq!(d.dme_configure(&[0u8; 24]).unwrap(), SimDevice::MODEL_ID as u16);
        assert!(
            d.transport()
                .log
                .contains(&Event::Bulk(Command::DmeStart, 300))
        );
    }

    #[test]
    fn model_size_echo_checked() {
        let mut sim = SimDevice::new();
        sim.model_size_skew = 1;
        let mut d = Dispatcher::new(sim, SimDevice::test_config());
        assert!(matches!(
            d.dme_start(&[0u8; 10], &[]),
            Err(LinkError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn end_mode_resets_with_mode_255() {
        let mut d = Dispatcher::new(SimDevice::new(), SimDevice::test_config());
        d.end_mode().unwrap();
        assert_eq!(d.transport().commands(Command::Reset), [(255, 0)]);
    }
}
