//! Input dispatch: inbound event payloads → the OS injector adapter.
//!
//! Per-event failures never propagate; a malformed payload bumps a counter
//! and an injector error is logged, both without disturbing the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use aircatch_protocol::messages::{KeyEvent, MediaKeyEvent, ScrollEvent, TouchEvent, TouchPhase};
use aircatch_protocol::packet::PacketKind;
use tracing::{debug, warn};

use crate::adapters::{InputInjector, PointerKind};

pub struct InputDispatcher {
    injector: Arc<dyn InputInjector>,
    malformed: AtomicU64,
}

impl InputDispatcher {
    pub fn new(injector: Arc<dyn InputInjector>) -> Self {
        Self {
            injector,
            malformed: AtomicU64::new(0),
        }
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn dispatch(&self, kind: PacketKind, payload: &[u8]) {
        match kind {
            PacketKind::TouchEvent => self.dispatch_touch(payload),
            PacketKind::ScrollEvent => self.dispatch_scroll(payload),
            PacketKind::KeyEvent => self.dispatch_key(payload),
            PacketKind::MediaKeyEvent => self.dispatch_media_key(payload),
            other => debug!(?other, "non-input packet reached the input dispatcher"),
        }
    }

    fn dispatch_touch(&self, payload: &[u8]) {
        let Some(event) = self.parse::<TouchEvent>(payload) else {
            return;
        };
        let kind = match event.phase {
            TouchPhase::Began => PointerKind::Down,
            TouchPhase::Moved => PointerKind::Move,
            TouchPhase::Ended => PointerKind::Up,
            TouchPhase::Cancelled => PointerKind::Cancel,
        };
        if let Err(e) = self.injector.inject_pointer(
            event.x,
            event.y,
            kind,
            (event.screen_width, event.screen_height),
        ) {
            warn!("pointer inject failed: {e:#}");
        }
    }

    fn dispatch_scroll(&self, payload: &[u8]) {
        let Some(event) = self.parse::<ScrollEvent>(payload) else {
            return;
        };
        if !(event.dx.is_finite() && event.dy.is_finite()) {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Err(e) = self
            .injector
            .inject_scroll(event.dx, event.dy, (event.x, event.y))
        {
            warn!("scroll inject failed: {e:#}");
        }
    }

    fn dispatch_key(&self, payload: &[u8]) {
        let Some(event) = self.parse::<KeyEvent>(payload) else {
            return;
        };
        // Keys with no usable code fall back to text insertion.
        let result = match (&event.text, event.code) {
            (Some(text), 0) if event.down => self.injector.inject_text(text),
            _ => self
                .injector
                .inject_key(event.code, event.modifiers, event.down),
        };
        if let Err(e) = result {
            warn!("key inject failed: {e:#}");
        }
    }

    fn dispatch_media_key(&self, payload: &[u8]) {
        let Some(event) = self.parse::<MediaKeyEvent>(payload) else {
            return;
        };
        if let Err(e) = self.injector.inject_media_key(event.key) {
            warn!("media key inject failed: {e:#}");
        }
    }

    fn parse<'a, T: serde::Deserialize<'a>>(&self, payload: &'a [u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(event) => Some(event),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("malformed input event: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aircatch_protocol::messages::MediaKey;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    pub(crate) enum Injected {
        Pointer(f64, f64, PointerKind),
        Scroll(f64, f64),
        Key(u16, u32, bool),
        Text(String),
        Media(MediaKey),
    }

    #[derive(Default)]
    pub(crate) struct FakeInjector {
        pub events: Mutex<Vec<Injected>>,
    }

    impl InputInjector for FakeInjector {
        fn inject_pointer(
            &self,
            norm_x: f64,
            norm_y: f64,
            kind: PointerKind,
            _screen_frame: (f64, f64),
        ) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Injected::Pointer(norm_x, norm_y, kind));
            Ok(())
        }
        fn inject_scroll(&self, dx: f64, dy: f64, _at: (f64, f64)) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(Injected::Scroll(dx, dy));
            Ok(())
        }
        fn inject_key(&self, code: u16, modifiers: u32, down: bool) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Injected::Key(code, modifiers, down));
            Ok(())
        }
        fn inject_text(&self, text: &str) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Injected::Text(text.to_string()));
            Ok(())
        }
        fn inject_media_key(&self, key: MediaKey) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(Injected::Media(key));
            Ok(())
        }
    }

    fn dispatcher() -> (InputDispatcher, Arc<FakeInjector>) {
        let injector = Arc::new(FakeInjector::default());
        (InputDispatcher::new(injector.clone()), injector)
    }

    #[test]
    fn touch_phases_map_to_pointer_kinds() {
        let (dispatcher, injector) = dispatcher();
        for (phase, expected) in [
            ("began", PointerKind::Down),
            ("moved", PointerKind::Move),
            ("ended", PointerKind::Up),
            ("cancelled", PointerKind::Cancel),
        ] {
            let payload = format!(
                r#"{{"x":0.5,"y":0.25,"phase":"{phase}","screenWidth":2388.0,"screenHeight":1668.0}}"#
            );
            dispatcher.dispatch(PacketKind::TouchEvent, payload.as_bytes());
            let events = injector.events.lock().unwrap();
            match events.last().unwrap() {
                Injected::Pointer(x, y, kind) => {
                    assert_eq!((*x, *y), (0.5, 0.25));
                    assert_eq!(*kind, expected);
                }
                other => panic!("expected pointer event, got {other:?}"),
            }
        }
    }

    #[test]
    fn key_events_inject_code_or_text() {
        let (dispatcher, injector) = dispatcher();
        dispatcher.dispatch(
            PacketKind::KeyEvent,
            br#"{"code":40,"modifiers":2,"down":true}"#,
        );
        dispatcher.dispatch(
            PacketKind::KeyEvent,
            r#"{"code":0,"modifiers":0,"down":true,"text":"é"}"#.as_bytes(),
        );
        let events = injector.events.lock().unwrap();
        assert_eq!(events[0], Injected::Key(40, 2, true));
        assert_eq!(events[1], Injected::Text("é".to_string()));
    }

    #[test]
    fn scroll_and_media_key_dispatch() {
        let (dispatcher, injector) = dispatcher();
        dispatcher.dispatch(
            PacketKind::ScrollEvent,
            br#"{"dx":0.0,"dy":-30.5,"x":0.5,"y":0.5}"#,
        );
        dispatcher.dispatch(PacketKind::MediaKeyEvent, br#"{"key":"volume_up"}"#);
        let events = injector.events.lock().unwrap();
        assert_eq!(events[0], Injected::Scroll(0.0, -30.5));
        assert_eq!(events[1], Injected::Media(MediaKey::VolumeUp));
    }

    #[test]
    fn malformed_payloads_count_and_inject_nothing() {
        let (dispatcher, injector) = dispatcher();
        dispatcher.dispatch(PacketKind::TouchEvent, b"not json");
        dispatcher.dispatch(PacketKind::ScrollEvent, br#"{"dx":"NaN"}"#);
        assert_eq!(dispatcher.malformed_events(), 2);
        assert!(injector.events.lock().unwrap().is_empty());
    }

    #[test]
    fn non_finite_scroll_deltas_are_rejected() {
        let (dispatcher, injector) = dispatcher();
        // serde_json won't produce non-finite floats from literals, but a
        // hostile client could send huge exponents that parse to infinity.
        dispatcher.dispatch(
            PacketKind::ScrollEvent,
            br#"{"dx":1e999,"dy":0.0,"x":0.0,"y":0.0}"#,
        );
        assert!(injector.events.lock().unwrap().is_empty());
    }
}
