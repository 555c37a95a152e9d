// SPDX-License-Identifier: CEPL-1.0
//! Primary command buffer recording for one frame.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;
use tracing::warn;

use crate::error::VkError;

/// The calls `record_render_pass` makes, in the order it makes them.
pub trait CommandEncoder {
    fn reset(&mut self) -> VkResult<()>;
    fn begin(&mut self) -> VkResult<()>;
    fn begin_render_pass(&mut self, framebuffer: vk::Framebuffer, extent: vk::Extent2D);
    fn end_render_pass(&mut self);
    fn end(&mut self) -> VkResult<()>;
}

pub struct PassEncoder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    clear: vk::ClearValue,
}

impl<'a> PassEncoder<'a> {
    pub fn new(
        device: &'a ash::Device,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        clear: vk::ClearValue,
    ) -> Self {
        Self {
            device,
            cmd,
            render_pass,
            clear,
        }
    }
}

impl CommandEncoder for PassEncoder<'_> {
    fn reset(&mut self) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin(&mut self) -> VkResult<()> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(self.cmd, &begin) }
    }

    fn begin_render_pass(&mut self, framebuffer: vk::Framebuffer, extent: vk::Extent2D) {
        let clears = [self.clear];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .cmd_begin_render_pass(self.cmd, &rp_begin, vk::SubpassContents::INLINE);
        }
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) }
    }

    fn end(&mut self) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(self.cmd) }
    }
}

fn stage(stage: &'static str) -> impl FnOnce(vk::Result) -> VkError {
    move |result| VkError::CommandBuffer { stage, result }
}

// STRICT ORDER: reset, begin, begin pass, body, end pass, end.
// The pass is closed and the buffer ended even when `body` fails, so the
// buffer never stays in the recording state.
pub fn record_render_pass<E: CommandEncoder>(
    encoder: &mut E,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    body: impl FnOnce() -> Result<()>,
) -> Result<()> {
    encoder.reset().map_err(stage("reset"))?;
    encoder.begin().map_err(stage("begin"))?;
    encoder.begin_render_pass(framebuffer, extent);

    let recorded = body();

    encoder.end_render_pass();
    let ended = encoder.end().map_err(stage("end"));

    match (recorded, ended) {
        (Err(e), ended) => {
            if let Err(end_err) = ended {
                warn!("{end_err} while unwinding a failed recording");
            }
            Err(e.context("recording frame commands"))
        }
        (Ok(()), Err(e)) => Err(e.into()),
        (Ok(()), Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
        fail_begin: bool,
    }

    impl CommandEncoder for Recorder {
        fn reset(&mut self) -> VkResult<()> {
            self.log.borrow_mut().push("reset".into());
            Ok(())
        }
        fn begin(&mut self) -> VkResult<()> {
            self.log.borrow_mut().push("begin".into());
            if self.fail_begin {
                Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            } else {
                Ok(())
            }
        }
        fn begin_render_pass(&mut self, framebuffer: vk::Framebuffer, extent: vk::Extent2D) {
            self.log.borrow_mut().push(format!(
                "pass fb={} {}x{}",
                framebuffer.as_raw(),
                extent.width,
                extent.height
            ));
        }
        fn end_render_pass(&mut self) {
            self.log.borrow_mut().push("end pass".into());
        }
        fn end(&mut self) -> VkResult<()> {
            self.log.borrow_mut().push("end".into());
            Ok(())
        }
    }

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 640,
        height: 480,
    };

    #[test]
    fn body_runs_inside_the_pass() {
        let mut enc = Recorder::default();
        let log = enc.log.clone();
        record_render_pass(&mut enc, vk::Framebuffer::from_raw(7), EXTENT, || {
            log.borrow_mut().push("body".into());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            *enc.log.borrow(),
            vec!["reset", "begin", "pass fb=7 640x480", "body", "end pass", "end"]
        );
    }

    #[test]
    fn failed_body_still_closes_the_buffer() {
        let mut enc = Recorder::default();
        let err = record_render_pass(&mut enc, vk::Framebuffer::from_raw(1), EXTENT, || {
            Err(anyhow!("layer exploded"))
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("layer exploded"));
        let log = enc.log.borrow();
        assert_eq!(log[log.len() - 2..], ["end pass", "end"]);
    }

    #[test]
    fn begin_failure_is_typed() {
        let mut enc = Recorder {
            fail_begin: true,
            ..Default::default()
        };
        let err = record_render_pass(&mut enc, vk::Framebuffer::null(), EXTENT, || Ok(()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VkError>(),
            Some(VkError::CommandBuffer { stage: "begin", .. })
        ));
        assert_eq!(*enc.log.borrow(), vec!["reset", "begin"]);
    }
}
