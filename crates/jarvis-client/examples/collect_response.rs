use std::sync::{Arc, Mutex};

use jarvis_client::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ClientError> {
    let _ = dotenvy::dotenv();
    init_observability();

    let client = JarvisClient::from_env()?;
    let answer = Arc::new(Mutex::new(None::<String>));

    let session = client
        .stream()
        .jarvis("Say hello in three words.", JarvisStreamOptions::default())?;
    let stop = session.stop_handle();
    let sink = answer.clone();
    let session = session.on_response(move |text, meta| {
        if meta.is_final {
            if let Ok(mut slot) = sink.lock() {
                *slot = Some(text.to_string());
            }
            // Speech and snapshots may still follow; we only need the text.
            stop.stop();
        }
    });

    let outcome = session.start().await?;
    let text = answer.lock().ok().and_then(|slot| slot.clone());
    println!("{outcome:?}: {}", text.unwrap_or_default());
    Ok(())
}
