//! Consumer: attaches to the producer's array and reads it
//!
//! Usage:
//! ```bash
//! cargo run --example consumer
//! ```

use shmlite_core::{NamedSemaphore, ScalarPool, SharedArray};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // count comes from the header written by the producer
    let frame = SharedArray::<f32>::attach("demo_frame")?;
    let lock = NamedSemaphore::try_open("demo_frame", 1, false)?;
    let seq = ScalarPool::global().get::<u64>("demo_seq")?;

    let (n, data) = {
        let _guard = lock.lock()?;
        (seq.load()?, frame.to_vec()?)
    };

    println!("Read frame {} ({} floats)", n, data.len());
    println!("First values: {:?}", &data[..data.len().min(4)]);

    Ok(())
}
