//! NApps bundled with the controller.
//!
//! * `of_relay` - core NApp bridging the wire and the pipeline. It promotes raw
//!   connection data to inbound messages and writes outbound messages to the
//!   destination connection.
//! * `echo` - ordinary NApp answering every inbound message with the same bytes.

use kyco_event_system::{
    core_events, ConnectionPool, Event, EventError, ListenerMap, NApp, NAppContext, NAppDescriptor,
    NAppError, Producer,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, Span};

pub const OF_RELAY: &str = "of_relay";
pub const ECHO: &str = "echo";

pub fn descriptors() -> Vec<NAppDescriptor> {
    vec![
        NAppDescriptor::new(OF_RELAY, |ctx| Ok(Box::new(OfRelay::new(ctx)?) as Box<dyn NApp>)).with_inbound(),
        NAppDescriptor::new(ECHO, |ctx| Ok(Box::new(Echo::new(ctx)) as Box<dyn NApp>)),
    ]
}

fn missing_connection(event: &Event) -> EventError {
    EventError::ListenerExecution(format!("{} carries no connection id", event.event_type()))
}

pub struct OfRelay {
    name: String,
    inbound: Producer,
    connections: Arc<ConnectionPool>,
    relayed: Arc<AtomicU64>,
    span: Span,
}

impl OfRelay {
    fn new(ctx: NAppContext) -> Result<Self, NAppError> {
        let inbound = ctx.inbound.ok_or_else(|| NAppError::InitializationFailed {
            name: ctx.name.clone(),
            reason: "the inbound producer was not granted".to_string(),
        })?;

        Ok(Self {
            name: ctx.name,
            inbound,
            connections: ctx.connections,
            relayed: Arc::new(AtomicU64::new(0)),
            span: ctx.span,
        })
    }
}

impl NApp for OfRelay {
    fn name(&self) -> &str {
        &self.name
    }

    fn listeners(&self) -> ListenerMap {
        let inbound = self.inbound.clone();
        let connections = self.connections.clone();
        let relayed = self.relayed.clone();
        let span_new = self.span.clone();
        let span_lost = self.span.clone();

        ListenerMap::new()
            .on(core_events::RAW_DATA, "promote_raw_data", move |event: &Event| {
                let connection = event.connection().ok_or_else(|| missing_connection(event))?;
                let data = event.expect_bytes()?;
                inbound.put(Event::bytes(core_events::MESSAGE_IN, data.to_vec()).with_connection(connection))?;
                Ok(())
            })
            .on(core_events::MESSAGE_OUT, "write_to_connection", move |event: &Event| {
                let connection = event.connection().ok_or_else(|| missing_connection(event))?;
                let data = event.expect_bytes()?;
                connections.send(connection, data.to_vec())?;
                relayed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .on(core_events::CONNECTION_NEW, "log_connection_new", move |event: &Event| {
                let _enter = span_new.enter();
                info!(connection = ?event.connection(), "Switch connected");
                Ok(())
            })
            .on(core_events::CONNECTION_LOST, "log_connection_lost", move |event: &Event| {
                let _enter = span_lost.enter();
                info!(connection = ?event.connection(), "Switch disconnected");
                Ok(())
            })
    }

    fn shutdown(&mut self) -> Result<(), NAppError> {
        let _enter = self.span.enter();
        info!(messages_written = self.relayed.load(Ordering::Relaxed), "Relay shutting down");
        Ok(())
    }
}

pub struct Echo {
    name: String,
    outbound: Producer,
    span: Span,
}

impl Echo {
    fn new(ctx: NAppContext) -> Self {
        Self {
            name: ctx.name,
            outbound: ctx.outbound,
            span: ctx.span,
        }
    }
}

impl NApp for Echo {
    fn name(&self) -> &str {
        &self.name
    }

    fn listeners(&self) -> ListenerMap {
        let outbound = self.outbound.clone();
        let span = self.span.clone();

        ListenerMap::new().on(core_events::MESSAGE_IN, "echo_message", move |event: &Event| {
            let connection = event.connection().ok_or_else(|| missing_connection(event))?;
            let data = event.expect_bytes()?;
            let _enter = span.enter();
            debug!(connection, bytes = data.len(), "Echoing message");
            outbound.put(Event::bytes(core_events::MESSAGE_OUT, data.to_vec()).with_connection(connection))?;
            Ok(())
        })
    }
}
