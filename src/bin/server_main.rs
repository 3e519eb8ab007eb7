#[tokio::main]
async fn main() {
    llm_gateway::run().await;
}
