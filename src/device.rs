use std::sync::Arc;

use futures::future;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DeviceConfig;
use crate::context::{ConnectionContext, ContextCell};
use crate::dispatcher::{CommandTicket, Dispatcher};
use crate::events::Event;
use crate::frame::Command;
use crate::gatt::GattDevice;
use crate::negotiator::{NegotiationState, Negotiator};
use crate::{Error, Result};

/// Virtual device id of the robot core
pub const DEVICE_ID_SPHERO: u8 = 0x02;
/// Set RGB LED output
pub const COMMAND_SET_RGB_LED: u8 = 0x20;

/// Observable state of the link to the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    /// Where the last handshake got to
    pub state: NegotiationState,
    /// Whether power-on finished and commands are being written
    pub started: bool,
}

/// Main struct for driving a BB-8 over Bluetooth LE
///
/// Commands can be submitted at any time; they are queued until a connection
/// is ready and then written in submission order.
pub struct Bb8<G: GattDevice> {
    /// The peripheral we talk to
    device: Arc<G>,
    /// Device-specific configuration
    config: DeviceConfig,
    /// Context currently handed to the dispatcher
    contexts: ContextCell<G>,
    /// Command queue and writer
    dispatcher: Dispatcher,
    /// Observability hook
    events: broadcast::Sender<Event>,
    /// Serializes connect and disconnect
    link: Mutex<LinkStatus>,
}

impl<G: GattDevice> Bb8<G> {
    /// Wraps a chosen peripheral with the default BB-8 configuration
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(device: G) -> Self {
        Self::with_config(device, DeviceConfig::default())
    }

    pub fn with_config(device: G, config: DeviceConfig) -> Self {
        let device = Arc::new(device);
        let contexts = ContextCell::new();
        let (events, _) = broadcast::channel(64);
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&device),
            contexts.subscribe(),
            events.clone(),
            config.write_interval,
        );

        Self {
            device,
            config,
            contexts,
            dispatcher,
            events,
            link: Mutex::new(LinkStatus {
                state: NegotiationState::Idle,
                started: false,
            }),
        }
    }

    /// Runs the handshake and power-on sequence
    ///
    /// Calling this while started and with the link still up only reports the
    /// current status. A link the robot dropped on its own is torn down and
    /// negotiated again. Dropping the returned future during power-on
    /// disconnects the half-open session in the background and leaves the
    /// status untouched.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<LinkStatus> {
        let mut link = self.link.lock().await;
        if link.started {
            if self.link_alive().await {
                debug!("Already connected");
                return Ok(*link);
            }
            warn!("Link lost, negotiating again");
            *link = LinkStatus {
                state: NegotiationState::Idle,
                started: false,
            };
            self.drop_context().await;
        }

        let mut negotiator =
            Negotiator::new(self.device.as_ref(), &self.config).with_events(self.events.clone());
        let context = match negotiator.negotiate().await {
            Ok(context) => context,
            Err(e) => {
                link.state = negotiator.state();
                return Err(e);
            }
        };
        let guard = SessionGuard::new(&self.device, &context.session);

        if let Err(e) = self.power_on(&context).await {
            error!("Power-on failed: {}", e);
            guard.disarm();
            link.state = NegotiationState::Failed;
            self.emit(Event::StateChanged(NegotiationState::Failed));
            if let Err(e) = self.device.disconnect(&context.session).await {
                warn!("Failed to disconnect after power-on failure: {}", e);
            }
            return Err(e);
        }

        guard.disarm();
        self.contexts.publish(Arc::new(context));
        *link = LinkStatus {
            state: NegotiationState::Ready,
            started: true,
        };
        info!("BB-8 started");
        self.emit(Event::Started);
        Ok(*link)
    }

    /// Whether the published session still holds its link
    async fn link_alive(&self) -> bool {
        let Some(current) = self.contexts.current() else {
            return false;
        };
        match self.device.is_connected(&current.context.session).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Could not query link state: {}", e);
                false
            }
        }
    }

    /// Invalidates the published context and closes its session
    async fn drop_context(&self) {
        let Some(current) = self.contexts.invalidate() else {
            return;
        };
        self.emit(Event::Disconnected);
        if let Err(e) = self.device.disconnect(&current.context.session).await {
            warn!("Failed to close stale session: {}", e);
        }
    }

    /// Unlocks the radio and wakes the CPU
    ///
    /// The three writes target different characteristics and run concurrently.
    /// Characteristics the peripheral does not expose are skipped.
    #[instrument(skip(self, context))]
    async fn power_on(&self, context: &ConnectionContext<G>) -> Result<()> {
        let power = &context.power;
        let tx_power = [self.config.tx_power_level];
        let wake_cpu = [self.config.wake_cpu_value];

        future::try_join3(
            self.write_optional("anti-DOS", power.anti_dos.as_ref(), self.config.anti_dos_unlock),
            self.write_optional("tx-power", power.tx_power.as_ref(), &tx_power),
            self.write_optional("wake-CPU", power.wake_cpu.as_ref(), &wake_cpu),
        )
        .await?;

        debug!("Power-on sequence acknowledged");
        Ok(())
    }

    async fn write_optional(
        &self,
        name: &str,
        characteristic: Option<&G::Characteristic>,
        value: &[u8],
    ) -> Result<()> {
        let Some(characteristic) = characteristic else {
            debug!("No {} characteristic, skipping", name);
            return Ok(());
        };

        debug!("Writing {} ({} bytes)", name, value.len());
        self.device
            .write_value(characteristic, value)
            .await
            .map_err(|e| Error::WriteFailed {
                uuid: self.device.characteristic_uuid(characteristic),
                reason: e.to_string(),
            })
    }

    /// Drops the connection
    ///
    /// Commands still queued stay pending and are written after the next
    /// successful `connect()`.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        *link = LinkStatus {
            state: NegotiationState::Idle,
            started: false,
        };

        let Some(current) = self.contexts.invalidate() else {
            debug!("Not connected");
            return Ok(());
        };
        self.emit(Event::Disconnected);
        self.device.disconnect(&current.context.session).await
    }

    /// Sets the RGB color of the robot's LEDs
    ///
    /// # Arguments
    ///
    /// * `red` - Red component (0-255)
    /// * `green` - Green component (0-255)
    /// * `blue` - Blue component (0-255)
    ///
    /// Components outside 0-255 are rejected and nothing is queued.
    #[instrument(skip(self, red, green, blue))]
    pub fn set_color<C: Into<i64>>(&self, red: C, green: C, blue: C) -> Result<CommandTicket> {
        let red = color_component("red", red.into())?;
        let green = color_component("green", green.into())?;
        let blue = color_component("blue", blue.into())?;

        info!("Setting color to RGB({}, {}, {})", red, green, blue);
        // Color command data: red, green, blue, flag
        let command = Command::new(
            DEVICE_ID_SPHERO,
            COMMAND_SET_RGB_LED,
            [red, green, blue, 0x00],
        )?
        .with_label("setColor");
        self.dispatcher.submit(command)
    }

    /// Queues an arbitrary command frame
    ///
    /// # Arguments
    ///
    /// * `device_id` - Virtual device id
    /// * `command_id` - Command id on that device
    /// * `payload` - Command data
    /// * `label` - Name shown in logs and outcomes
    #[instrument(skip(self, payload))]
    pub fn send_command(
        &self,
        device_id: u8,
        command_id: u8,
        payload: Vec<u8>,
        label: Option<&str>,
    ) -> Result<CommandTicket> {
        debug!(
            "Sending command: did={:#04x}, cid={:#04x}, {} payload bytes",
            device_id,
            command_id,
            payload.len()
        );
        let mut command = Command::new(device_id, command_id, payload)?;
        if let Some(label) = label {
            command = command.with_label(label);
        }
        self.dispatcher.submit(command)
    }

    pub async fn status(&self) -> LinkStatus {
        *self.link.lock().await
    }

    /// Whether a connection context is currently published
    pub fn is_connected(&self) -> bool {
        self.contexts.current().is_some()
    }

    pub async fn is_started(&self) -> bool {
        self.link.lock().await.started
    }

    /// Receives state transitions and command outcomes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

/// Disconnects a freshly negotiated session unless disarmed
///
/// Covers a `connect()` future dropped during power-on.
struct SessionGuard<G: GattDevice> {
    device: Arc<G>,
    session: Option<G::Session>,
}

impl<G: GattDevice> SessionGuard<G> {
    fn new(device: &Arc<G>, session: &G::Session) -> Self {
        Self {
            device: Arc::clone(device),
            session: Some(session.clone()),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }
}

impl<G: GattDevice> Drop for SessionGuard<G> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime left to close an abandoned session");
            return;
        };
        warn!("Connect abandoned during power-on, closing session");
        let device = Arc::clone(&self.device);
        runtime.spawn(async move {
            if let Err(e) = device.disconnect(&session).await {
                warn!("Failed to close abandoned session: {}", e);
            }
        });
    }
}

fn color_component(name: &str, value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| {
        Error::InvalidCommandInput(format!("{name} value {value} out of range (0..=255)"))
    })
}

/// Parses `R,G,B` into color components
pub fn parse_rgb(input: &str) -> Result<(u8, u8, u8)> {
    let parts: Vec<&str> = input.split(',').map(str::trim).collect();
    let [r, g, b] = parts[..] else {
        return Err(Error::InvalidCommandInput(format!(
            "expected R,G,B but got {input:?}"
        )));
    };

    let component = |name: &str, raw: &str| -> Result<u8> {
        let value: i64 = raw.parse().map_err(|_| {
            Error::InvalidCommandInput(format!("{name} value {raw:?} is not a number"))
        })?;
        color_component(name, value)
    };
    Ok((
        component("red", r)?,
        component("green", g)?,
        component("blue", b)?,
    ))
}

/// Parses a byte given as decimal or `0x`-prefixed hex
pub fn parse_byte(input: &str) -> Result<u8> {
    let input = input.trim();
    let parsed = match input.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|e| Error::InvalidCommandInput(format!("invalid byte {input:?}: {e}")))
}

/// Parses a run of hex digit pairs, e.g. `ff000000`
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let input = input.trim();
    if input.len() % 2 != 0 {
        return Err(Error::InvalidCommandInput(format!(
            "hex payload {input:?} has an odd number of digits"
        )));
    }

    (0..input.len())
        .step_by(2)
        .map(|i| {
            input
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| {
                    Error::InvalidCommandInput(format!("invalid hex at offset {i} in {input:?}"))
                })
        })
        .collect()
}
