//! Integration tests for interrupt delivery to a driver bound under a bus.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddk_io::binding::{BindInst, BindProgram, Cond};
use ddk_io::device::{DeviceAddArgs, DeviceContext, DeviceOps};
use ddk_io::driver::{BindContext, Driver};
use ddk_io::interrupt::{
    InterruptController, InterruptProtocolOps, InterruptThread, IrqAction,
};
use ddk_io::props::keys;
use ddk_io::protocol::{PROTOCOL_INTERRUPT, Protocol};
use ddk_io::{DevHost, DeviceState, Error, Result};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Child device that owns the interrupt thread for its line.
struct NicOps {
    irq: Mutex<Option<InterruptThread>>,
    handled: Sender<u64>,
}

impl DeviceOps for NicOps {
    fn unbind(&self, _ctx: &DeviceContext<'_>) {
        let thread = self.irq.lock().unwrap().take();
        if let Some(thread) = thread {
            let total = thread.shutdown().unwrap_or(0);
            let _ = self.handled.send(total + 1000);
        }
    }
}

struct NicDriver {
    program: BindProgram,
    events: Mutex<Sender<u64>>,
}

impl Driver for NicDriver {
    fn name(&self) -> &str {
        "nic"
    }

    fn bind_program(&self) -> &BindProgram {
        &self.program
    }

    fn bind(&self, ctx: &mut BindContext<'_>) -> Result<()> {
        let parent = ctx.parent();
        let irqs = ctx
            .host()
            .get_protocol::<InterruptProtocolOps>(parent, PROTOCOL_INTERRUPT)?;
        let line = irqs.with(|ops| ops.map_interrupt(0))??;

        let tx = self.events.lock().unwrap().clone();
        let handler_tx = tx.clone();
        let thread = InterruptThread::spawn("nic-irq", line, move |irq| {
            let _ = handler_tx.send(irq.count());
            IrqAction::Complete
        })?;

        ctx.add_device(
            DeviceAddArgs::new("eth0")
                .non_bindable(true)
                .ops(Arc::new(NicOps {
                    irq: Mutex::new(Some(thread)),
                    handled: tx,
                })),
        )?;
        Ok(())
    }
}

fn nic_host() -> Result<(DevHost, Receiver<u64>)> {
    let (tx, rx) = mpsc::channel();
    let driver = Arc::new(NicDriver {
        program: BindProgram::new(
            "acme",
            "1",
            vec![BindInst::match_if(
                Cond::Eq,
                keys::BIND_PROTOCOL,
                PROTOCOL_INTERRUPT,
            )],
        )?,
        events: Mutex::new(tx),
    });
    let host = DevHost::builder().name("irq").driver(driver).build()?;
    Ok((host, rx))
}

#[test]
fn test_driver_handles_parent_interrupts() -> Result<()> {
    init_logging();

    let (host, handled) = nic_host()?;
    let controller = InterruptController::new(64, 2);
    let ops: InterruptProtocolOps = Arc::new(controller.clone());
    let bus = host.add_device(
        host.root(),
        DeviceAddArgs::new("bus").protocol(Protocol::new(PROTOCOL_INTERRUPT, ops)),
    )?;
    host.settle()?;
    assert_eq!(host.bound_driver(bus)?.as_deref(), Some("nic"));
    let eth = host.find("eth0").expect("nic published eth0");

    for expect in 1..=4 {
        controller.trigger(0)?;
        assert_eq!(handled.recv_timeout(Duration::from_secs(5)).unwrap(), expect);
    }
    // Line 1 is not mapped by anyone.
    controller.trigger(1)?;
    assert!(handled.recv_timeout(Duration::from_millis(20)).is_err());

    let handle = host.get_protocol::<InterruptProtocolOps>(bus, PROTOCOL_INTERRUPT)?;
    host.remove(bus)?;

    // Unbinding the child stopped its thread after four deliveries.
    assert_eq!(handled.recv_timeout(Duration::from_secs(5)).unwrap(), 1004);
    assert_eq!(host.state(eth)?, DeviceState::Removed);
    assert!(matches!(
        handle.with(|ops| ops.map_interrupt(0).is_ok()),
        Err(Error::PeerClosed)
    ));

    host.shutdown()
}

#[test]
fn test_bind_fails_without_interrupt_protocol() -> Result<()> {
    init_logging();

    let (host, _handled) = nic_host()?;
    // Advertises the interrupt protocol id but publishes the wrong ops type.
    let bus = host.add_device(
        host.root(),
        DeviceAddArgs::new("bus").protocol(Protocol::new(PROTOCOL_INTERRUPT, 0u8)),
    )?;
    host.settle()?;
    assert_eq!(host.bind_state(bus)?, DeviceState::Unbound);
    assert!(host.find("eth0").is_none());

    host.shutdown()
}
