//! Game-thread dispatch example
//!
//! Demonstrates posting, sending and bridging futures onto named threads
//! using the in-process loopback host.

use std::time::Duration;
use futures::channel::oneshot;
use thread_affine::ambient;
use thread_affine::prelude::*;

fn thread_name() -> String {
    std::thread::current().name().unwrap_or("<unnamed>").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Game Thread Example ===\n");

    let host = LoopbackHost::start(LoopbackConfig {
        any_thread_workers: 2,
        ..Default::default()
    })?;
    let dispatcher = host.dispatcher();

    // Example 1: Fire-and-forget post
    println!("1. Posting to the game thread:");
    let game = dispatcher.context(ThreadId::GAME_THREAD);
    game.post(|| println!("   Posted callback running on {}", thread_name()));

    // Example 2: Blocking send with a result
    println!("\n2. Sending to the rendering thread:");
    let render = dispatcher.context(ThreadId::ACTUAL_RENDERING_THREAD_LOCAL);
    let frame = render.send(|| {
        println!("   Building frame on {}", thread_name());
        60
    })?;
    println!("   Rendering thread answered: {} fps", frame);

    // Example 3: Background work through the any-thread pool
    println!("\n3. Background work:");
    let background = dispatcher.context(ThreadId::ANY_BACKGROUND_THREAD_NORMAL_TASK);
    // Handed off from the game thread; an unnamed caller would run it inline
    let name = game.send(move || background.send(thread_name))??;
    println!("   Background task ran on {}", name);

    // Example 4: Bridging a future so ambient dispatch targets the game thread
    println!("\n4. Continuation bridge:");
    let (tx, rx) = oneshot::channel::<&'static str>();
    let bridged = rx.with_thread_context(&dispatcher, ThreadId::GAME_THREAD, true);
    ambient::post(|| println!("   Ambient post landed on {}", thread_name()))?;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send("level loaded");
    });
    match bridged.await? {
        Some(message) => println!("   Operation finished: {}", message),
        None => println!("   Operation was cancelled"),
    }
    println!("   Ambient context restored: {}", ambient::current().is_none());

    host.shutdown();
    println!("\n=== Example completed successfully! ===");
    Ok(())
}
