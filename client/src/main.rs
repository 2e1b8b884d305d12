use std::{
    env,
    io::{self, Read, Write},
    net::TcpStream,
    process,
    time::Duration,
};

use serde_json::{json, Value};

fn main() -> Result<(), io::Error> {
    let mut args = env::args().skip(1);

    let remote_addr = args.next().unwrap_or_else(|| {
        eprintln!("usage: dht-client <host:port> ping|get <key>|set <key> <value>");
        process::exit(1);
    });

    let command = args.next().unwrap_or_else(|| {
        eprintln!("error: no command provided");
        process::exit(1);
    });

    let request_msg = match command.as_str() {
        "ping" => "ping".to_string(),
        "get" => {
            let key = args.next().unwrap_or_else(|| {
                eprintln!("error: get needs a key");
                process::exit(1);
            });
            format!("get {}", json!({ "key": key }))
        }
        "set" => {
            let key = args.next().unwrap_or_else(|| {
                eprintln!("error: set needs a key");
                process::exit(1);
            });
            let raw = args.next().unwrap_or_else(|| {
                eprintln!("error: set needs a value");
                process::exit(1);
            });
            // A value that parses as JSON is sent as-is; anything else is a
            // plain string.
            let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            format!("set {}", json!({ "key": key, "value": value }))
        }
        other => {
            eprintln!("error: unknown command {other:?}");
            process::exit(1);
        }
    };

    let mut stream = TcpStream::connect(&remote_addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    stream.write_all(request_msg.as_bytes())?;
    stream.write_all(b"\r\n")?;

    let response = read_response(&mut stream)?;
    println!("{response}");

    Ok(())
}

// Reads one CR LF terminated frame.
fn read_response(stream: &mut TcpStream) -> Result<String, io::Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a full response arrived",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            break;
        }
    }
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
