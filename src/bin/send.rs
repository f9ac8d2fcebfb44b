//! FastDump 송신 중계기
//!
//! 표준 입력의 길이 접두어 레코드(`[len:u32 BE][bytes]`)를 읽어 선택적으로
//! 셰이핑한 뒤 UDP 단편으로 전송
//!
//! 사용법:
//!   cargo run --release --bin fastdump-send -- [OPTIONS] < records.bin
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin fastdump-send -- --dest 10.0.0.2:9100 < records.bin
//!
//!   # 처리율 제어 (1 MiB/s 넘으면 압축, 5 MiB/s 넘으면 드롭)
//!   cargo run --release --bin fastdump-send -- -d 10.0.0.2:9100 --rate-control --lwm 1 --hwm 5

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fastdump::{Config, Error, FragmentSender, ShapingConfig, ShapingPipe};

/// 입력 레코드 상한. 손상된 길이 접두어로 인한 과대 할당 방지
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// 송신 중계기 설정
struct SendArgs {
    bind_addr: SocketAddr,
    dest_addr: SocketAddr,
    config_path: Option<PathBuf>,
    chunk_size: Option<usize>,
    rate_control: bool,
    lwm: f64,
    hwm: f64,
    wm_interval: Option<f64>,
    debug: bool,
}

impl Default for SendArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            dest_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            config_path: None,
            chunk_size: None,
            rate_control: false,
            lwm: 1.0,
            hwm: 5.0,
            wm_interval: None,
            debug: false,
        }
    }
}

fn parse_args() -> SendArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SendArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dest" | "-d" => {
                if i + 1 < args.len() {
                    config.dest_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--chunk-size" => {
                if i + 1 < args.len() {
                    config.chunk_size = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--rate-control" | "-r" => {
                config.rate_control = true;
            }
            "--lwm" => {
                if i + 1 < args.len() {
                    config.lwm = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--hwm" => {
                if i + 1 < args.len() {
                    config.hwm = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--wm-interval" => {
                if i + 1 < args.len() {
                    config.wm_interval = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--debug" => {
                config.debug = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"fastdump-send - FastDump 송신 중계기

표준 입력의 [len:u32 BE][bytes] 레코드를 UDP 단편으로 전송

사용법:
  cargo run --release --bin fastdump-send -- [OPTIONS] < records.bin

옵션:
  -d, --dest <ADDR>       수신자 주소 (기본: 127.0.0.1:9100)
  -b, --bind <ADDR>       송신 소켓 바인드 주소 (기본: 0.0.0.0:0)
  -c, --config <PATH>     TOML 설정 파일
  --chunk-size <SIZE>     데이터그램 크기 바이트 (기본: 1024)
  -r, --rate-control      처리율 기반 셰이핑 활성화
  --lwm <MIB/S>           압축 시작 처리율 (기본: 1.0)
  --hwm <MIB/S>           드롭 시작 처리율 (기본: 5.0)
  --wm-interval <MIB>     재평가 윈도우 (기본: max(2*hwm, 4*lwm))
  --debug                 디버그 로그
  -h, --help              이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    config
}

fn init_logging(debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// 레코드 하나 읽기. 레코드 경계에서 EOF면 `None`
async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > MAX_RECORD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("레코드 길이 {} > {}", len, MAX_RECORD_SIZE),
        ));
    }

    let mut record = vec![0u8; len];
    reader.read_exact(&mut record).await?;
    Ok(Some(record))
}

/// 메시지 하나 전송. 크기 초과는 건너뛰고 나머지 에러만 반환
async fn send_message(
    sender: &mut FragmentSender,
    message: &[u8],
    socket: &UdpSocket,
    dest: SocketAddr,
) -> Result<(), Error> {
    match sender.send(message, socket, dest).await {
        Ok(_) => Ok(()),
        Err(Error::MessageTooLarge { len, max }) => {
            warn!("메시지 건너뜀: {} bytes > {} bytes", len, max);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.debug)?;

    let mut config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if args.rate_control {
        config.shaping = ShapingConfig::from_mib(args.lwm, args.hwm, args.wm_interval);
    }

    let mut sender = FragmentSender::new(config.clone())?;
    let mut shaper = if config.shaping.is_enabled() {
        Some(ShapingPipe::new(config.shaping)?.with_unit_limit(config.max_sendable_size()))
    } else {
        None
    };

    let socket = UdpSocket::bind(args.bind_addr).await?;
    info!("FastDump sender started: {} → {}", socket.local_addr()?, args.dest_addr);
    info!("Chunk size: {} bytes", config.chunk_size);

    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(record) = read_record(&mut stdin).await? {
        match shaper.as_mut() {
            Some(shaper) => {
                for unit in shaper.process(&record)? {
                    send_message(&mut sender, &unit.to_bytes(), &socket, args.dest_addr).await?;
                }
            }
            None => send_message(&mut sender, &record, &socket, args.dest_addr).await?,
        }
    }

    debug!("입력 종료");

    if let Some(shaper) = shaper.as_mut() {
        if let Some(unit) = shaper.finish()? {
            send_message(&mut sender, &unit.to_bytes(), &socket, args.dest_addr).await?;
        }
        info!("{}", shaper.stats().summary());
    }
    info!("{}", sender.stats().summary());

    Ok(())
}
