//! End-to-end scenarios over loopback

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use webcam_share::capture::synthetic::test_pattern;
use webcam_share::capture::{
    CameraSelector, CaptureBackend, DeviceRegistry, Frame, FrameSource, SyntheticBackend,
    SyntheticCamera,
};
use webcam_share::config::{CaptureConfig, ClientConfig, ServerConfig};
use webcam_share::network::{
    Announcer, AnnouncerConfig, Discovery, StreamClient, StreamEnd, StreamServer,
};

fn two_frame_registry() -> Arc<DeviceRegistry> {
    let camera = SyntheticCamera::new("Fake Cam", test_pattern(4, 4, 2))
        .with_interval(Duration::from_millis(15));
    let backend: Arc<dyn CaptureBackend> =
        Arc::new(SyntheticBackend::new("synthetic", 50, vec![camera]));
    Arc::new(DeviceRegistry::new(vec![backend], CaptureConfig::default()))
}

#[test]
fn test_camera_to_client_over_http() {
    let mut source = FrameSource::new(two_frame_registry());
    source.start(&CameraSelector::Index(0)).unwrap();

    let mut server = StreamServer::new(
        ServerConfig {
            bind_host: "127.0.0.1".into(),
            port: 0,
            announce: false,
            ..Default::default()
        },
        source.store(),
    );
    let addr = server.start().unwrap();

    let mut client = StreamClient::new(
        format!("http://{}/stream.mjpg", addr),
        ClientConfig::default(),
    );
    client.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut distinct: HashSet<Vec<u8>> = HashSet::new();
    while Instant::now() < deadline && distinct.len() < 2 {
        let Some(frame) = client.next_frame() else {
            break;
        };
        assert_eq!(frame.size(), (4, 4));
        // JPEG is lossy; bucket by dominant colour of the first pixel
        let pixel = frame.pixel(0, 0).unwrap();
        distinct.insert(pixel.iter().map(|c| c / 64).collect());
    }
    assert!(distinct.len() >= 2, "only saw {} distinct frames", distinct.len());

    client.stop();
    client.stop();
    server.stop();
    server.stop();
    source.stop();
    source.stop();
}

#[test]
fn test_discovery_finds_announcer_on_loopback() {
    let mut announcer = Announcer::new(AnnouncerConfig {
        port: 0,
        stream_port: 8000,
        name: "host-a".into(),
        advertise_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    });
    let announce_addr = announcer.start().unwrap();

    let discovery = Discovery::new(
        vec![SocketAddr::from((Ipv4Addr::LOCALHOST, announce_addr.port()))],
        Duration::from_millis(800),
    );
    let servers = discovery.discover().unwrap();

    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].port, 8000);
    assert_eq!(servers[0].name, "host-a");
    announcer.stop();
}

#[test]
fn test_back_to_back_frames_in_one_chunk() {
    let mut encoder = webcam_share::codec::JpegEncoder::new(90).unwrap();
    let first = encoder.encode(&Frame::solid(8, 8, [250, 10, 10])).unwrap();
    let second = encoder.encode(&Frame::solid(8, 8, [10, 10, 250])).unwrap();

    let mut body = Vec::new();
    body.extend_from_slice(&first);
    body.extend_from_slice(&second);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            let mut response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(&body);
            // one write so both frames arrive together
            let _ = stream.write_all(&response);
        }
    });

    let mut client = StreamClient::new(format!("http://{}/", addr), ClientConfig::default());
    client.start().unwrap();
    let frames: Vec<Frame> = client.frames().collect();

    assert_eq!(frames.len(), 2);
    let red = frames[0].pixel(4, 4).unwrap();
    let blue = frames[1].pixel(4, 4).unwrap();
    assert!(red[0] > red[2]);
    assert!(blue[2] > blue[0]);
    assert_eq!(client.end_reason(), Some(&StreamEnd::Eof));
}
