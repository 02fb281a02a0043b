use std::sync::Arc;
use std::time::{Duration, Instant};

use camrelay::overlay::is_placeholder;
use camrelay::{
    generate_candidates, BackoffPolicy, CameraContext, CameraEndpoint, CandidateScript,
    ConnectionState, Credentials, Emission, ReconnectSupervisor, StreamMultiplexer,
    StreamSettings, SupervisorSettings, SyntheticConnector,
};

fn jpeg_payload(part: &[u8]) -> &[u8] {
    let start = part
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("part header")
        + 4;
    &part[start..part.len() - 2]
}

#[test]
fn consumers_see_placeholders_after_camera_drops() {
    let endpoint =
        CameraEndpoint::new("cam.test", Credentials::default(), 80, 554, "test").unwrap();
    let candidates = generate_candidates(&endpoint).unwrap();
    let connector = SyntheticConnector::new().with_script(
        &candidates[0].url,
        vec![
            CandidateScript::stream_failing_after(50),
            CandidateScript::refuse("camera powered off"),
        ],
    );

    let context = CameraContext::new(endpoint);
    let settings = SupervisorSettings {
        probe_timeout: Duration::from_millis(200),
        read_watchdog: Duration::from_millis(200),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..SupervisorSettings::default()
    };
    let supervisor = ReconnectSupervisor::new(Arc::clone(&context), Arc::new(connector), settings)
        .unwrap()
        .spawn()
        .unwrap();

    let multiplexer = StreamMultiplexer::new(
        Arc::clone(&context),
        StreamSettings {
            target_fps: 60,
            quality: 80,
            grace: Duration::from_millis(60),
            placeholder_interval: Duration::from_millis(20),
        },
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while context.state() != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "camera never connected");
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut session = multiplexer.subscribe("outage-test");
    assert_eq!(multiplexer.active_sessions(), 1);

    let never = || false;
    let mut frame_sequences = Vec::new();
    let mut placeholders = 0;
    while placeholders < 10 {
        assert!(Instant::now() < deadline, "outage never surfaced");
        let chunk = session.next_chunk(&never).expect("session ended");
        assert!(chunk.bytes.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        match chunk.emission {
            Emission::Frame { sequence } => {
                assert_eq!(placeholders, 0, "frame after the outage began");
                frame_sequences.push(sequence);
            }
            Emission::Placeholder { state } => {
                assert_ne!(state, ConnectionState::Connected);
                let image = image::load_from_memory(jpeg_payload(&chunk.bytes))
                    .unwrap()
                    .to_rgb8();
                assert!(is_placeholder(&image));
                placeholders += 1;
            }
        }
    }

    assert!(!frame_sequences.is_empty());
    assert!(frame_sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(context.status().failed_passes >= 1);

    drop(session);
    assert_eq!(multiplexer.active_sessions(), 0);
    supervisor.stop().unwrap();
}
