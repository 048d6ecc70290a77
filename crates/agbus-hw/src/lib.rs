//! The hardware seam: driver plugins and the thread that pumps them
//!
//! The core never touches a driver directly. A [HardwarePlugin] adapts one CAN device to a
//! uniform non-blocking read/write contract, and a [HardwareInterface] runs every plugin on a
//! dedicated thread, funnelling frames through the core's two bounded queues. The
//! [VirtualBus] provides an in-process bus so tests and demos can run whole networks without
//! hardware.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use agbus_core::frame::CanFrame;
use agbus_core::queue::FrameQueue;

/// One CAN device (SocketCAN socket, PCAN channel, TWAI controller, ...)
///
/// Implementations must not block for long in [read_frame](HardwarePlugin::read_frame) or
/// [write_frame](HardwarePlugin::write_frame); the pump thread services every channel in turn.
pub trait HardwarePlugin: Send {
    fn open(&mut self) -> eyre::Result<()>;
    fn close(&mut self);
    fn is_valid(&self) -> bool;
    /// Fill in a received frame if one is available
    fn read_frame(&mut self, frame: &mut CanFrame) -> bool;
    fn write_frame(&mut self, frame: &CanFrame) -> bool;
}

/// Observes frames crossing the hardware boundary
pub type FrameHook = Box<dyn Fn(&CanFrame) + Send>;

/// Runs every registered plugin on one pump thread
///
/// Inbound frames are stamped with their channel index and a microsecond timestamp, then pushed
/// into the core's rx queue (dropping the newest frame if it is full; the queue counts drops).
/// Outbound frames are popped from the tx queue and routed to the plugin for their channel.
pub struct HardwareInterface {
    rx: Arc<FrameQueue>,
    tx: Arc<FrameQueue>,
    plugins: Vec<Box<dyn HardwarePlugin>>,
    on_receive: Vec<FrameHook>,
    on_transmit: Vec<FrameHook>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl HardwareInterface {
    /// Build an interface around the core's queues (see
    /// [Network::rx_queue](agbus_core::network::Network::rx_queue))
    #[must_use]
    pub fn new(rx: Arc<FrameQueue>, tx: Arc<FrameQueue>) -> Self {
        Self {
            rx,
            tx,
            plugins: Vec::new(),
            on_receive: Vec::new(),
            on_transmit: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Register a plugin; returns the channel index frames from it will carry
    ///
    /// Channels must be registered before [start](HardwareInterface::start).
    pub fn add_channel(&mut self, plugin: Box<dyn HardwarePlugin>) -> eyre::Result<u8> {
        if self.thread.is_some() {
            eyre::bail!("Cannot add channels while the hardware interface is running");
        }
        self.plugins.push(plugin);
        Ok((self.plugins.len() - 1) as u8)
    }

    /// Observe every frame read off the hardware
    pub fn add_receive_hook(&mut self, hook: FrameHook) {
        self.on_receive.push(hook);
    }

    /// Observe every frame written to the hardware
    pub fn add_transmit_hook(&mut self, hook: FrameHook) {
        self.on_transmit.push(hook);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Open every plugin and start the pump thread
    pub fn start(&mut self) -> eyre::Result<()> {
        if self.thread.is_some() {
            eyre::bail!("Hardware interface already started");
        }
        for (channel, plugin) in self.plugins.iter_mut().enumerate() {
            plugin
                .open()
                .map_err(|e| e.wrap_err(format!("Failed to open CAN channel {channel}")))?;
        }

        let mut plugins = std::mem::take(&mut self.plugins);
        let on_receive = std::mem::take(&mut self.on_receive);
        let on_transmit = std::mem::take(&mut self.on_transmit);
        let rx = Arc::clone(&self.rx);
        let tx = Arc::clone(&self.tx);
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;
        running.store(true, Ordering::Relaxed);

        let thread = std::thread::Builder::new()
            .name("agbus-hw".into())
            .spawn(move || {
                let epoch = Instant::now();
                while running.load(Ordering::Relaxed) {
                    let mut idle = true;

                    for (channel, plugin) in plugins.iter_mut().enumerate() {
                        if !plugin.is_valid() {
                            continue;
                        }
                        let mut frame = CanFrame::default();
                        while plugin.read_frame(&mut frame) {
                            idle = false;
                            frame.channel = channel as u8;
                            frame.timestamp_us = Some(epoch.elapsed().as_micros() as u64);
                            for hook in &on_receive {
                                hook(&frame);
                            }
                            rx.try_push(frame);
                        }
                    }

                    while let Some(frame) = tx.pop() {
                        idle = false;
                        match plugins.get_mut(frame.channel as usize) {
                            Some(plugin) => {
                                if plugin.write_frame(&frame) {
                                    for hook in &on_transmit {
                                        hook(&frame);
                                    }
                                } else {
                                    tracing::warn!(
                                        "Write failed on channel {}; dropping frame {:?}",
                                        frame.channel,
                                        frame.id
                                    );
                                }
                            }
                            None => {
                                tracing::warn!(
                                    "Frame for unknown channel {}; dropping",
                                    frame.channel
                                );
                            }
                        }
                    }

                    if idle {
                        std::thread::sleep(poll_interval);
                    }
                }
                for plugin in plugins.iter_mut() {
                    plugin.close();
                }
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the pump thread and close every plugin
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Hardware pump thread panicked");
            }
        }
    }
}

impl Drop for HardwareInterface {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct VirtualBusInner {
    /// One receive queue per attached plugin
    queues: Vec<VecDeque<CanFrame>>,
}

/// An in-process CAN bus
///
/// Every plugin attached with [plugin](VirtualBus::plugin) sees frames written by all the
/// others, like ECUs sharing a physical bus. Arbitration, bit timing, and error frames are not
/// modelled.
#[derive(Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<VirtualBusInner>>,
}

impl VirtualBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new device to the bus
    #[must_use]
    pub fn plugin(&self) -> VirtualCanPlugin {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.push(VecDeque::new());
        VirtualCanPlugin {
            bus: self.clone(),
            index: inner.queues.len() - 1,
            open: false,
        }
    }
}

/// One device on a [VirtualBus]
pub struct VirtualCanPlugin {
    bus: VirtualBus,
    index: usize,
    open: bool,
}

impl HardwarePlugin for VirtualCanPlugin {
    fn open(&mut self) -> eyre::Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_valid(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self, frame: &mut CanFrame) -> bool {
        if !self.open {
            return false;
        }
        let mut inner = self.bus.inner.lock().unwrap();
        match inner.queues[self.index].pop_front() {
            Some(received) => {
                *frame = received;
                true
            }
            None => false,
        }
    }

    fn write_frame(&mut self, frame: &CanFrame) -> bool {
        if !self.open {
            return false;
        }
        let mut inner = self.bus.inner.lock().unwrap();
        for (index, queue) in inner.queues.iter_mut().enumerate() {
            if index != self.index {
                queue.push_back(*frame);
            }
        }
        true
    }
}

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
