// Message dispatcher - per-session state machine over inbound frames
//
// One Dispatcher per session, driven sequentially by that session's transport
// task, so frames from one source are processed in arrival order. The filter
// state lives here: it is partitioned per tracking source and never shared.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::fanout::FanoutReport;
use crate::filter::{AccuracyClass, GpsSample, SignalFilter};
use crate::geodesy::ReferencePoint;
use crate::net::messages::{decode_frame, ArkitSample, ClientMessage, FrameError, GpsFix, ServerMessage};
use crate::record::{ProcessedRecord, RecordSource};
use crate::registry::{ClientRole, SessionHandle};
use crate::stats::Stats;

/// What a successfully handled frame did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Role in effect after the identify
    Identified(ClientRole),
    /// A record was produced and handed to the broker
    Published(FanoutReport),
    Ponged,
}

pub struct Dispatcher {
    handle: SessionHandle,
    broker: Arc<Broker>,
    filter: SignalFilter,
    reference_rx: watch::Receiver<ReferencePoint>,
}

impl Dispatcher {
    pub fn new(
        handle: SessionHandle,
        broker: Arc<Broker>,
        reference_rx: watch::Receiver<ReferencePoint>,
    ) -> Self {
        let reference = *reference_rx.borrow();
        let filter = SignalFilter::new(broker.config().filter, reference);
        Self {
            handle,
            broker,
            filter,
            reference_rx,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.handle.id()
    }

    pub fn filter(&self) -> &SignalFilter {
        &self.filter
    }

    /// Handle one inbound text frame.
    ///
    /// Errors are per-frame: the caller logs nothing further and keeps the
    /// session open.
    pub async fn handle_frame(&mut self, text: &str) -> Result<Dispatched, FrameError> {
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(e) if e.is_decode_error() => return Err(self.reject(e)),
            Err(e) => {
                // Well-formed JSON, so the client is alive
                self.note_received();
                info!(session = self.session_id(), "Frame dropped: {}", e);
                return Err(e);
            }
        };
        self.note_received();

        match message {
            ClientMessage::Identify { client_type } => Ok(self.identify(client_type).await),
            ClientMessage::Location(fix) => self.location(fix).await,
            ClientMessage::ArkitLocation { data } => self.arkit_location(data).await,
            ClientMessage::Ping => {
                self.broker.reply(&self.handle, &ServerMessage::Pong { timestamp: Utc::now() });
                Ok(Dispatched::Ponged)
            }
            // decode_frame never yields the catch-all
            ClientMessage::Unknown => Err(FrameError::UnknownType(String::new())),
        }
    }

    fn note_received(&self) {
        self.handle.touch();
        Stats::incr(&self.broker.stats().messages_received);
    }

    fn reject(&self, err: FrameError) -> FrameError {
        Stats::incr(&self.broker.stats().decode_errors);
        warn!(session = self.session_id(), "Dropping frame: {}", err);
        err
    }

    async fn identify(&self, requested: ClientRole) -> Dispatched {
        let id = self.session_id();
        match self.broker.registry().set_role(id, requested).await {
            Some(role) if role == requested => {
                info!(session = id, role = ?role, "Client identified");
                Dispatched::Identified(role)
            }
            Some(role) => {
                debug!(session = id, current = ?role, requested = ?requested, "Repeated identify ignored");
                Dispatched::Identified(role)
            }
            None => Dispatched::Identified(ClientRole::Unknown),
        }
    }

    async fn location(&mut self, fix: GpsFix) -> Result<Dispatched, FrameError> {
        if !valid_fix(&fix) {
            return Err(self.reject(FrameError::InvalidCoordinates));
        }
        self.sync_reference();

        let sample = GpsSample {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
        };
        let position = self.filter.process(&sample);
        let quality = AccuracyClass::classify(fix.accuracy);
        if quality == AccuracyClass::Poor {
            warn!(session = self.session_id(), accuracy = fix.accuracy, "Poor GPS accuracy");
        }

        let now = Utc::now();
        let record = ProcessedRecord {
            seq: self.broker.next_seq(),
            client_id: self.session_id(),
            received_at: now,
            source: RecordSource::Gps,
            position_3d: position,
            accuracy: fix.accuracy,
            quality,
            timestamp: fix.timestamp.unwrap_or_else(|| now.into()),
            latitude: Some(fix.latitude),
            longitude: Some(fix.longitude),
            altitude: fix.altitude,
            heading: fix.heading,
            speed: fix.speed,
        };
        debug!(session = self.session_id(), x = position.x, z = position.z, "GPS location processed");
        Ok(Dispatched::Published(self.broker.publish(record).await))
    }

    async fn arkit_location(&self, data: ArkitSample) -> Result<Dispatched, FrameError> {
        if !data.position_3d.is_finite() || !data.accuracy.is_finite() {
            return Err(self.reject(FrameError::InvalidCoordinates));
        }
        let record = ProcessedRecord {
            seq: self.broker.next_seq(),
            client_id: self.session_id(),
            received_at: Utc::now(),
            source: RecordSource::Arkit,
            position_3d: data.position_3d,
            accuracy: data.accuracy,
            quality: AccuracyClass::classify(data.accuracy),
            timestamp: data.timestamp,
            latitude: None,
            longitude: None,
            altitude: None,
            heading: None,
            speed: None,
        };
        Ok(Dispatched::Published(self.broker.publish(record).await))
    }

    /// Adopt a reference point published since the last GPS sample
    fn sync_reference(&mut self) {
        if !self.reference_rx.has_changed().unwrap_or(false) {
            return;
        }
        let reference = *self.reference_rx.borrow_and_update();
        if self.filter.set_reference(reference) {
            debug!(session = self.session_id(), "Filter reset for new reference point");
        }
    }
}

fn valid_fix(fix: &GpsFix) -> bool {
    fix.latitude.is_finite()
        && fix.longitude.is_finite()
        && fix.accuracy.is_finite()
        && (-90.0..=90.0).contains(&fix.latitude)
        && (-180.0..=180.0).contains(&fix.longitude)
}
