#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    let _rocket = chat_relay::rocket_from_env().await.launch().await?;
    Ok(())
}
