//! Door and communication-watchdog interlocks.
//!
//! Each interlock is an observable boolean with its own lock and listener
//! list. Setters may be called from any thread; listeners always run on the
//! dispatcher, and only when the value actually changes.

use std::sync::Arc;

use oven_core::protocol::parse_door_line;
use parking_lot::Mutex;
use tracing::info;

use crate::dispatch::DispatchHandle;

/// Callback invoked with the new value of an interlock.
pub type FlagListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Observable boolean with change-only notification.
pub struct ObservableFlag {
    name: &'static str,
    state: Mutex<FlagState>,
    dispatch: DispatchHandle,
}

struct FlagState {
    value: bool,
    listeners: Vec<FlagListener>,
}

impl ObservableFlag {
    fn new(name: &'static str, initial: bool, dispatch: DispatchHandle) -> Self {
        Self {
            name,
            state: Mutex::new(FlagState {
                value: initial,
                listeners: Vec::new(),
            }),
            dispatch,
        }
    }

    #[must_use]
    pub fn get(&self) -> bool {
        self.state.lock().value
    }

    /// Updates the value; listeners are notified only on change.
    ///
    /// The notification is queued before the lock is released, so concurrent
    /// setters deliver their changes in the order the value took them.
    pub fn set(&self, value: bool) {
        let mut state = self.state.lock();
        if state.value == value {
            return;
        }
        state.value = value;
        self.notify(state.listeners.clone(), value);
        drop(state);
        info!(flag = self.name, value, "interlock changed");
    }

    /// Registers `listener`; duplicates are ignored. With `fire_immediately`
    /// the listener is also queued once with the current value.
    pub fn add_listener(&self, listener: FlagListener, fire_immediately: bool) {
        let mut state = self.state.lock();
        if !state
            .listeners
            .iter()
            .any(|known| Arc::ptr_eq(known, &listener))
        {
            state.listeners.push(Arc::clone(&listener));
        }
        if fire_immediately {
            self.notify(vec![listener], state.value);
        }
    }

    pub fn remove_listener(&self, listener: &FlagListener) {
        self.state
            .lock()
            .listeners
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    fn notify(&self, listeners: Vec<FlagListener>, value: bool) {
        if listeners.is_empty() {
            return;
        }
        self.dispatch.post(move || {
            for listener in listeners {
                listener(value);
            }
        });
    }
}

/// Door-open and watchdog-timed-out interlocks for one appliance.
///
/// The door starts out open: the oven is treated as unsafe until the
/// controller reports the door closed.
pub struct InterlockModel {
    door_open: ObservableFlag,
    wdt_timed_out: ObservableFlag,
}

impl InterlockModel {
    pub const DOOR_OPEN_DEFAULT: bool = true;

    #[must_use]
    pub fn new(dispatch: &DispatchHandle) -> Self {
        Self {
            door_open: ObservableFlag::new("door_open", Self::DOOR_OPEN_DEFAULT, dispatch.clone()),
            wdt_timed_out: ObservableFlag::new("wdt_timed_out", false, dispatch.clone()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.door_open.set(open);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.door_open.get()
    }

    pub fn set_wdt_timed_out(&self, timed_out: bool) {
        self.wdt_timed_out.set(timed_out);
    }

    #[must_use]
    pub fn is_wdt_timed_out(&self) -> bool {
        self.wdt_timed_out.get()
    }

    #[must_use]
    pub fn door(&self) -> &ObservableFlag {
        &self.door_open
    }

    #[must_use]
    pub fn watchdog(&self) -> &ObservableFlag {
        &self.wdt_timed_out
    }

    /// Applies a door-state line. Returns `true` when the line was one.
    pub fn parse_controller_line(&self, line: &str) -> bool {
        match parse_door_line(line) {
            Some(open) => {
                self.set_open(open);
                true
            }
            None => false,
        }
    }
}
