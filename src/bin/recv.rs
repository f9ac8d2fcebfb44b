//! FastDump 수신 중계기
//!
//! UDP 단편을 재조립하고 선택적으로 디셰이핑한 뒤 표준 출력에
//! 길이 접두어 레코드(`[len:u32 BE][bytes]`)로 기록
//!
//! 사용법:
//!   cargo run --release --bin fastdump-recv -- [OPTIONS] > records.bin
//!
//! 예시:
//!   cargo run --release --bin fastdump-recv -- --bind 0.0.0.0:9100 --rate-control

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fastdump::{Config, DeshapingPipe, FragmentReceiver};

/// 수신 중계기 설정
struct RecvArgs {
    bind_addr: SocketAddr,
    config_path: Option<PathBuf>,
    chunk_size: Option<usize>,
    max_gap: Option<u32>,
    rate_control: bool,
    debug: bool,
}

impl Default for RecvArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            config_path: None,
            chunk_size: None,
            max_gap: None,
            rate_control: false,
            debug: false,
        }
    }
}

fn parse_args() -> RecvArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RecvArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
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
            "--max-gap" => {
                if i + 1 < args.len() {
                    config.max_gap = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--rate-control" | "-r" => {
                config.rate_control = true;
            }
            "--debug" => {
                config.debug = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"fastdump-recv - FastDump 수신 중계기

UDP 단편을 재조립해 표준 출력에 [len:u32 BE][bytes] 레코드로 기록

사용법:
  cargo run --release --bin fastdump-recv -- [OPTIONS] > records.bin

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9100)
  -c, --config <PATH>     TOML 설정 파일
  --chunk-size <SIZE>     데이터그램 크기 바이트 (기본: 1024)
  --max-gap <N>           재정렬 허용 폭 (기본: 1000)
  -r, --rate-control      셰이핑 단위 디코드 (송신측 --rate-control과 짝)
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

async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &[u8]) -> io::Result<()> {
    writer.write_u32(record.len() as u32).await?;
    writer.write_all(record).await
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
    if let Some(max_gap) = args.max_gap {
        config.max_gap = max_gap;
    }

    let mut deshaper = if args.rate_control || config.shaping.is_enabled() {
        Some(DeshapingPipe::new())
    } else {
        None
    };

    let mut receiver = FragmentReceiver::bind(config, args.bind_addr).await?;
    let mut stdout = BufWriter::new(tokio::io::stdout());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let message: Bytes = tokio::select! {
            received = receiver.recv() => received?,
            _ = &mut shutdown => {
                info!("종료 신호 수신");
                break;
            }
        };

        match deshaper.as_mut() {
            Some(deshaper) => match deshaper.process(&message) {
                Ok(messages) => {
                    for m in messages {
                        write_record(&mut stdout, &m).await?;
                    }
                }
                Err(e) => warn!("셰이핑 단위 폐기: {}", e),
            },
            None => write_record(&mut stdout, &message).await?,
        }
        stdout.flush().await?;
    }

    stdout.flush().await?;

    info!("{}", receiver.stats().summary());
    if let Some(deshaper) = deshaper.as_ref() {
        info!("{}", deshaper.stats().summary());
    }

    Ok(())
}
