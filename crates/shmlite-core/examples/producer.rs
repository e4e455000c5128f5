//! Producer: writes a shared array and publishes a sequence number
//!
//! Usage:
//! ```bash
//! cargo run --example producer
//! ```

use shmlite_core::{NamedSemaphore, ScalarPool, SharedArray};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let frame = SharedArray::<f32>::create_filled("demo_frame", 256, 0.0);
    if !frame.is_valid() {
        return Err("cannot create demo_frame".into());
    }
    let lock = NamedSemaphore::try_open("demo_frame", 1, false)?;
    let seq = ScalarPool::global().get_or_init::<u64>("demo_seq", 0)?;

    println!("Producing into 'demo_frame' ({} floats). Press Ctrl+C to exit...", frame.len());

    for n in 1u64.. {
        {
            let _guard = lock.lock()?;
            for i in 0..frame.len() {
                frame.set(i, (n as f32) + i as f32 / 1000.0)?;
            }
            seq.store(n)?;
        }
        println!("wrote frame {}", n);
        thread::sleep(Duration::from_secs(1));
    }

    Ok(())
}
