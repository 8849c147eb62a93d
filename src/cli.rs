//! Interactive client for a flydb node's binary wire protocol. SQL
//! execution lives outside this crate, so the only commands this shell
//! understands are the ones the wire protocol itself carries: `ping` and
//! `quit`.

use bytes::BytesMut;
use clap::Parser;
use tokio::io::{stdin, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use flydb::wire::frame::FrameType;
use flydb::wire::mux::MuxFrame;
use flydb::{DbError, Result, VERSION};

/// This shell speaks one logical stream per connection; a real multi-stream
/// client would allocate ids from a client-side `StreamTable` instead of
/// hardcoding the first client id.
const STREAM_ID: u32 = 1;

#[derive(Debug, Parser)]
#[command(name = "flydb-cli", about = "flydb wire protocol client")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:6381")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    println!("flydb-cli {VERSION}");
    println!("connecting to {}...", args.addr);

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .map_err(|e| DbError::Network(format!("failed to connect: {e}")))?;
    println!("connected. commands: ping, quit");

    let mut reader = BufReader::new(stdin());
    let mut input = String::new();
    let mut recv_buf = BytesMut::with_capacity(4096);

    loop {
        print!("flydb> ");
        std::io::Write::flush(&mut std::io::stdout()).ok();

        input.clear();
        if reader.read_line(&mut input).await? == 0 {
            break;
        }
        let cmd = input.trim();
        if cmd.is_empty() {
            continue;
        }
        if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("exit") {
            println!("goodbye");
            break;
        }
        if !cmd.eq_ignore_ascii_case("ping") {
            println!("unrecognized command: {cmd}");
            continue;
        }

        let request = MuxFrame { stream_id: STREAM_ID, frame_type: FrameType::Ping, compressed: false, payload: b"ping".to_vec() };
        stream.write_all(&request.encode()?).await.map_err(|e| DbError::Network(e.to_string()))?;

        let response = loop {
            if let Some(decoded) = MuxFrame::try_decode(&mut recv_buf)? {
                break decoded;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.map_err(|e| DbError::Network(e.to_string()))?;
            if n == 0 {
                println!("connection closed by server");
                return Ok(());
            }
            recv_buf.extend_from_slice(&chunk[..n]);
        };

        match response.frame_type {
            FrameType::Pong => println!("PONG ({} bytes echoed)", response.payload.len()),
            FrameType::Error => println!("ERROR: {}", String::from_utf8_lossy(&response.payload)),
            other => println!("unexpected response frame type {other:?}"),
        }
    }
    Ok(())
}
