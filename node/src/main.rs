use std::error::Error;
use std::io;

use dht_node::cli::Args;
use dht_node::Dht;
use log::LevelFilter;
use simple_logger::SimpleLogger;

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).init()?;

    let args = Args::parse()?;

    let dht = Dht::new(args.addr().clone(), args.remote().cloned())
        .map_err(|e| format!("cannot start node on {}: {e}", args.addr()))?;

    println!("node is running on {}", dht.addr());
    println!("press enter to shut down");

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    println!("shutting down..");
    dht.shutdown();

    Ok(())
}
