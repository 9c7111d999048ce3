//! Media Review Backend - binary entry point
//! Delegates to the library for all app logic.

#[tokio::main]
async fn main() {
    media_review_backend::run().await;
}
