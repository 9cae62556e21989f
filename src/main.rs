#[tokio::main]
async fn main() {
    deepboard::run().await;
}
