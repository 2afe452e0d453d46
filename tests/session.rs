use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use stagelinq::{
    config::Config,
    discovery::{Action, Discovery, DiscoveryMessage, Software},
    events::Event,
    player::Layer,
    service::{
        directory::DirectoryMessage,
        state_map::{StateData, StateValue},
    },
    stagelinq::StageLinq,
    token::Token,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Reads and discards everything until the client hangs up.
async fn drain(mut socket: TcpStream) {
    let mut buffer = [0; 1024];
    while let Ok(n) = socket.read(&mut buffer).await {
        if n == 0 {
            break;
        }
    }
}

/// A device that offers StateMap and FileTransfer and plays `states` once
/// the StateMap connection is up.
struct FakeDevice {
    token: Token,
    directory_port: u16,
}

impl FakeDevice {
    async fn start(token: Token, states: Vec<StateData>) -> Self {
        let directory = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let state_map = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let file_transfer = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let directory_port = directory.local_addr().unwrap().port();
        let state_map_port = state_map.local_addr().unwrap().port();
        let file_transfer_port = file_transfer.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = directory.accept().await.unwrap();
            socket
                .write_all(&DirectoryMessage::ServicesRequest { token }.encode().unwrap())
                .await
                .unwrap();

            let mut request = [0; 20];
            socket.read_exact(&mut request).await.unwrap();

            for (service, port) in [("StateMap", state_map_port), ("FileTransfer", file_transfer_port)] {
                let announcement = DirectoryMessage::ServicesAnnouncement {
                    token,
                    service: service.to_owned(),
                    port,
                };
                socket.write_all(&announcement.encode().unwrap()).await.unwrap();
            }
            drain(socket).await;
        });

        tokio::spawn(async move {
            let (mut socket, _) = state_map.accept().await.unwrap();
            for state in states {
                socket.write_all(&state.encode().unwrap()).await.unwrap();
            }
            drain(socket).await;
        });

        tokio::spawn(async move {
            let (socket, _) = file_transfer.accept().await.unwrap();
            drain(socket).await;
        });

        Self {
            token,
            directory_port,
        }
    }

    fn announcement(&self, action: Action) -> Vec<u8> {
        DiscoveryMessage {
            token: self.token,
            source: String::from("fake-deck"),
            action,
            software: Software {
                name: String::from("JP11"),
                version: String::from("4.0.0"),
            },
            port: self.directory_port,
        }
        .encode()
        .unwrap()
    }
}

fn config() -> Config {
    Config {
        expected_service_count: Some(2),
        debounce_window: Duration::from_millis(100),
        ..Config::default()
    }
}

async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<Event>, mut matches: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

fn track_loaded(token: Token) -> (String, Vec<StateData>) {
    let path = format!("net://{token}/USB 1/Engine Library/Music/a.mp3");
    let states = vec![
        StateData::new("/Engine/Deck1/Track/SongLoaded", StateValue::from_bool(true)),
        StateData::new(
            "/Engine/Deck1/Track/TrackNetworkPath",
            StateValue::from_string(path.clone()),
        ),
    ];
    (path, states)
}

#[tokio::test]
async fn loaded_track_is_reported_once() {
    let token = Token::fast_v4();
    let (path, states) = track_loaded(token);
    let device = FakeDevice::start(token, states).await;

    let config = config();
    let session = StageLinq::new(config.clone());
    let mut events = session.subscribe();

    let info = Discovery::accept(&config, &device.announcement(Action::Login), LOCALHOST).unwrap();
    session.handle_discovery(info).await;

    let discovered = next_event(&mut events, |event| matches!(event, Event::Discovered(_))).await;
    assert!(matches!(discovered, Event::Discovered(info) if info.token == token));

    let loaded = next_event(&mut events, |event| matches!(event, Event::TrackLoaded(_))).await;
    let Event::TrackLoaded(status) = loaded else {
        unreachable!()
    };
    assert_eq!(status.layer, Layer::A);
    assert_eq!(status.deck, "1A");
    assert_eq!(status.state.track_network_path.as_deref(), Some(path.as_str()));
    assert_eq!(
        status.location.db_source_name,
        Some(format!("net://{token}/USB 1"))
    );
    assert_eq!(status.location.track_path.as_deref(), Some("Music/a.mp3"));

    // Nothing else loads within a few debounce windows.
    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, Event::TrackLoaded(_)), "{event:?}");
    }

    session.disconnect().await;
}

#[tokio::test]
async fn repeated_announcements_connect_once_and_logout_disconnects() {
    let token = Token::fast_v4();
    let device = FakeDevice::start(token, Vec::new()).await;

    let config = config();
    let session = StageLinq::new(config.clone());
    let mut events = session.subscribe();

    let login = device.announcement(Action::Login);
    for _ in 0..3 {
        let info = Discovery::accept(&config, &login, LOCALHOST).unwrap();
        session.handle_discovery(info).await;
    }

    let mut discovered = 0;
    let connected = next_event(&mut events, |event| {
        if matches!(event, Event::Discovered(_)) {
            discovered += 1;
        }
        matches!(event, Event::Connected(_))
    })
    .await;
    assert!(matches!(connected, Event::Connected(info) if info.token == token));
    assert_eq!(session.devices().len(), 1);
    assert!(session.device(token).is_some());

    let info = Discovery::accept(&config, &device.announcement(Action::Logout), LOCALHOST).unwrap();
    session.handle_discovery(info).await;

    let disconnected =
        next_event(&mut events, |event| matches!(event, Event::Disconnected(_))).await;
    assert_eq!(disconnected, Event::Disconnected(token));
    assert!(session.devices().is_empty());
    assert_eq!(discovered, 1);
}

#[tokio::test]
async fn unreachable_device_fails_after_retries() {
    // Bind and drop a listener to get a port nobody listens on.
    let port = TcpListener::bind((LOCALHOST, 0))
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let config = Config {
        max_connection_attempts: 2,
        min_connection_backoff: Duration::from_millis(10),
        max_connection_backoff: Duration::from_millis(20),
        ..config()
    };
    let session = StageLinq::new(config.clone());
    let mut events = session.subscribe();

    let token = Token::fast_v4();
    let announcement = DiscoveryMessage {
        token,
        source: String::from("fake-deck"),
        action: Action::Login,
        software: Software {
            name: String::from("JP11"),
            version: String::from("4.0.0"),
        },
        port,
    };
    let info = Discovery::accept(&config, &announcement.encode().unwrap(), LOCALHOST).unwrap();
    session.handle_discovery(info).await;

    let failed = next_event(&mut events, |event| matches!(event, Event::DeviceFailed(_))).await;
    assert_eq!(failed, Event::DeviceFailed(token));
    assert!(session.device(token).is_none());
}
