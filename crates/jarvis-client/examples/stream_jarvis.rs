use std::io::Write as _;

use jarvis_client::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ClientError> {
    let _ = dotenvy::dotenv();
    init_observability();

    let client = JarvisClient::from_env()?;
    let session = client
        .stream()
        .jarvis(
            "Give me a one-line weather summary.",
            JarvisStreamOptions::default().interim(true),
        )?
        .on_response(|text, meta| {
            if meta.is_final {
                println!("\n{text}");
            } else {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        })
        .on_tool_call(|call| eprintln!("[tool] {call}"))
        .on_error(|err| eprintln!("stream error: {err}"))
        .on_done(|done| eprintln!("[done:{}]", done.scope));

    let outcome = session.start().await?;
    eprintln!("session finished: {outcome:?}");
    Ok(())
}
