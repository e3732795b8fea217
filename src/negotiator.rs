//! Ordered GATT handshake producing a [`ConnectionContext`].

use std::fmt;

use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, trace};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::context::{ConnectionContext, PowerCharacteristics};
use crate::events::Event;
use crate::gatt::GattDevice;
use crate::{Error, Result};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    GattConnecting,
    /// Opening the radio service
    Service1Resolving,
    /// Looking up tx-power, anti-DOS and wake-CPU
    Characteristics1Resolving,
    /// Opening the robot service
    Service2Resolving,
    /// Looking up the control characteristic
    Characteristic2Resolving,
    Ready,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Ready | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::GattConnecting => "gatt_connecting",
            NegotiationState::Service1Resolving => "service1_resolving",
            NegotiationState::Characteristics1Resolving => "characteristics1_resolving",
            NegotiationState::Service2Resolving => "service2_resolving",
            NegotiationState::Characteristic2Resolving => "characteristic2_resolving",
            NegotiationState::Ready => "ready",
            NegotiationState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Runs one handshake attempt; no retries
pub struct Negotiator<'a, G: GattDevice> {
    device: &'a G,
    config: &'a DeviceConfig,
    events: Option<broadcast::Sender<Event>>,
    state: NegotiationState,
}

impl<'a, G: GattDevice> Negotiator<'a, G> {
    pub fn new(device: &'a G, config: &'a DeviceConfig) -> Self {
        Self {
            device,
            config,
            events: None,
            state: NegotiationState::Idle,
        }
    }

    /// Publishes every state transition on `events`
    pub fn with_events(mut self, events: broadcast::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Drives the handshake to `Ready` or `Failed`
    #[instrument(skip(self))]
    pub async fn negotiate(&mut self) -> Result<ConnectionContext<G>> {
        match self.run().await {
            Ok(context) => {
                self.advance(NegotiationState::Ready);
                info!("GATT handshake complete");
                Ok(context)
            }
            Err(e) => {
                error!("GATT handshake failed during {}: {}", self.state, e);
                self.advance(NegotiationState::Failed);
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<ConnectionContext<G>> {
        self.advance(NegotiationState::GattConnecting);
        let session = self
            .device
            .connect()
            .await
            .map_err(|e| Error::GattConnectFailed(e.to_string()))?;

        self.advance(NegotiationState::Service1Resolving);
        let radio_service = self
            .service(&session, self.config.radio_service_uuid)
            .await?;

        self.advance(NegotiationState::Characteristics1Resolving);
        let (tx_power, anti_dos, wake_cpu) = futures::try_join!(
            self.characteristic(&radio_service, self.config.tx_power_uuid),
            self.characteristic(&radio_service, self.config.anti_dos_uuid),
            self.characteristic(&radio_service, self.config.wake_cpu_uuid),
        )?;

        self.advance(NegotiationState::Service2Resolving);
        let robot_service = self
            .service(&session, self.config.robot_service_uuid)
            .await?;

        self.advance(NegotiationState::Characteristic2Resolving);
        let control = self
            .characteristic(&robot_service, self.config.control_uuid)
            .await?
            .ok_or_else(|| Error::CharacteristicResolutionFailed {
                uuid: self.config.control_uuid,
                reason: "not exposed by peripheral".into(),
            })?;

        Ok(ConnectionContext {
            session,
            radio_service,
            robot_service,
            control,
            power: PowerCharacteristics {
                anti_dos,
                tx_power,
                wake_cpu,
            },
        })
    }

    async fn service(&self, session: &G::Session, uuid: Uuid) -> Result<G::Service> {
        debug!("Resolving primary service {}", uuid);
        self.device
            .primary_service(session, uuid)
            .await
            .map_err(|e| Error::ServiceResolutionFailed {
                uuid,
                reason: e.to_string(),
            })
    }

    async fn characteristic(
        &self,
        service: &G::Service,
        uuid: Uuid,
    ) -> Result<Option<G::Characteristic>> {
        debug!("Resolving characteristic {}", uuid);
        let characteristic = self
            .device
            .characteristic(service, uuid)
            .await
            .map_err(|e| Error::CharacteristicResolutionFailed {
                uuid,
                reason: e.to_string(),
            })?;

        if characteristic.is_none() {
            debug!("Characteristic {} not exposed by peripheral", uuid);
        }
        Ok(characteristic)
    }

    fn advance(&mut self, next: NegotiationState) {
        trace!("Handshake {} -> {}", self.state, next);
        self.state = next;
        if let Some(events) = &self.events {
            // No subscribers is fine
            let _ = events.send(Event::StateChanged(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::mock::{Call, MockGatt};

    fn collect_states(rx: &mut broadcast::Receiver<Event>) -> Vec<NegotiationState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::StateChanged(state) = event {
                states.push(state);
            }
        }
        states
    }

    #[tokio::test]
    async fn handshake_runs_stages_in_order() {
        let gatt = MockGatt::new();
        let config = DeviceConfig::default();
        let (tx, mut rx) = broadcast::channel(32);

        let mut negotiator = Negotiator::new(&gatt, &config).with_events(tx);
        let context = negotiator.negotiate().await.unwrap();

        assert_eq!(negotiator.state(), NegotiationState::Ready);
        assert_eq!(context.control, config.control_uuid);
        assert_eq!(context.radio_service, config.radio_service_uuid);
        assert_eq!(context.robot_service, config.robot_service_uuid);
        assert_eq!(context.power.anti_dos, Some(config.anti_dos_uuid));

        assert_eq!(
            collect_states(&mut rx),
            vec![
                NegotiationState::GattConnecting,
                NegotiationState::Service1Resolving,
                NegotiationState::Characteristics1Resolving,
                NegotiationState::Service2Resolving,
                NegotiationState::Characteristic2Resolving,
                NegotiationState::Ready,
            ]
        );

        let calls = gatt.calls();
        assert_eq!(calls[0], Call::Connect);
        assert_eq!(calls[1], Call::PrimaryService(config.radio_service_uuid));
        let mut stage3: Vec<_> = calls[2..5].to_vec();
        stage3.sort_by_key(|c| format!("{c:?}"));
        let mut expected = vec![
            Call::Characteristic(config.tx_power_uuid),
            Call::Characteristic(config.anti_dos_uuid),
            Call::Characteristic(config.wake_cpu_uuid),
        ];
        expected.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(stage3, expected);
        assert_eq!(calls[5], Call::PrimaryService(config.robot_service_uuid));
        assert_eq!(calls[6], Call::Characteristic(config.control_uuid));
        assert_eq!(calls.len(), 7);
    }

    #[tokio::test]
    async fn stage_three_failure_fails_closed() {
        let config = DeviceConfig::default();
        for failing in [
            config.tx_power_uuid,
            config.anti_dos_uuid,
            config.wake_cpu_uuid,
        ] {
            let gatt = MockGatt::new();
            gatt.fail_lookup(failing);

            let mut negotiator = Negotiator::new(&gatt, &config);
            let err = negotiator.negotiate().await.unwrap_err();

            assert!(matches!(
                err,
                Error::CharacteristicResolutionFailed { uuid, .. } if uuid == failing
            ));
            assert_eq!(negotiator.state(), NegotiationState::Failed);
            let calls = gatt.calls();
            assert!(!calls.contains(&Call::PrimaryService(config.robot_service_uuid)));
            assert!(!calls.contains(&Call::Characteristic(config.control_uuid)));
        }
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_gatt_connect() {
        let gatt = MockGatt::new();
        gatt.fail_connect();
        let config = DeviceConfig::default();

        let err = Negotiator::new(&gatt, &config).negotiate().await.unwrap_err();
        assert!(matches!(err, Error::GattConnectFailed(_)));
        assert_eq!(gatt.calls(), vec![Call::Connect]);
    }

    #[tokio::test]
    async fn radio_service_failure_stops_before_characteristics() {
        let gatt = MockGatt::new();
        let config = DeviceConfig::default();
        gatt.fail_lookup(config.radio_service_uuid);

        let mut negotiator = Negotiator::new(&gatt, &config);
        let err = negotiator.negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ServiceResolutionFailed { uuid, .. } if uuid == config.radio_service_uuid
        ));
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(
            gatt.calls(),
            vec![
                Call::Connect,
                Call::PrimaryService(config.radio_service_uuid)
            ]
        );
    }

    #[tokio::test]
    async fn missing_robot_service_fails() {
        let gatt = MockGatt::new();
        let config = DeviceConfig::default();
        gatt.mark_absent(config.robot_service_uuid);

        let err = Negotiator::new(&gatt, &config).negotiate().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ServiceResolutionFailed { uuid, .. } if uuid == config.robot_service_uuid
        ));
    }

    #[tokio::test]
    async fn absent_control_characteristic_fails() {
        let gatt = MockGatt::new();
        let config = DeviceConfig::default();
        gatt.mark_absent(config.control_uuid);

        let mut negotiator = Negotiator::new(&gatt, &config);
        let err = negotiator.negotiate().await.unwrap_err();
        assert!(matches!(err, Error::CharacteristicResolutionFailed { .. }));
        assert_eq!(negotiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn absent_power_characteristic_is_tolerated() {
        let gatt = MockGatt::new();
        let config = DeviceConfig::default();
        gatt.mark_absent(config.anti_dos_uuid);

        let context = Negotiator::new(&gatt, &config).negotiate().await.unwrap();
        assert!(context.power.anti_dos.is_none());
        assert!(context.power.tx_power.is_some());
        assert!(context.power.wake_cpu.is_some());
    }
}
