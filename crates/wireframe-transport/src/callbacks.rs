use wireframe_codec::DecodedMessage;
use wireframe_core::error::CoreError;

use crate::connection::Connection;

/// The user-supplied callback set a [`crate::Listener`] or client
/// connection dispatches into. Only the contract between the core and
/// these callbacks is in scope here — the callbacks themselves are an
/// external collaborator (spec.md §1).
#[derive(Default)]
pub struct Callbacks {
    pub on_connect: Option<Box<dyn Fn(&mut Connection)>>,
    pub on_message: Option<Box<dyn Fn(&mut Connection, DecodedMessage)>>,
    pub on_close: Option<Box<dyn Fn(&mut Connection)>>,
    pub on_error: Option<Box<dyn Fn(&mut Connection, CoreError)>>,
    pub on_buffer_full: Option<Box<dyn Fn(&mut Connection)>>,
    pub on_buffer_drain: Option<Box<dyn Fn(&mut Connection)>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_connect(&self, conn: &mut Connection) {
        if let Some(cb) = &self.on_connect {
            cb(conn);
        }
    }

    pub fn fire_message(&self, conn: &mut Connection, message: DecodedMessage) {
        if let Some(cb) = &self.on_message {
            cb(conn, message);
        }
    }

    pub fn fire_close(&self, conn: &mut Connection) {
        if let Some(cb) = &self.on_close {
            cb(conn);
        }
    }

    pub fn fire_error(&self, conn: &mut Connection, err: CoreError) {
        if let Some(cb) = &self.on_error {
            cb(conn, err);
        }
    }

    pub fn fire_buffer_full(&self, conn: &mut Connection) {
        if let Some(cb) = &self.on_buffer_full {
            cb(conn);
        }
    }

    pub fn fire_buffer_drain(&self, conn: &mut Connection) {
        if let Some(cb) = &self.on_buffer_drain {
            cb(conn);
        }
    }
}
