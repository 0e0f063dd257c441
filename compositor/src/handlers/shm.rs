//! wl_shm handler.

use smithay::{
    delegate_shm,
    wayland::shm::{ShmHandler, ShmState},
};

use crate::state::ServerState;

impl ShmHandler for ServerState {
    fn shm_state(&self) -> &ShmState {
        &self.shm_state
    }
}

delegate_shm!(ServerState);
