use std::{thread::sleep, time::Duration};

use dogstatsd_forwarder::ForwarderBuilder;

fn main() {
    tracing_subscriber::fmt::init();

    let forwarder = ForwarderBuilder::default()
        .with_remote_address("127.0.0.1:8125")
        .expect("failed to parse remote address")
        .with_flush_interval(Duration::from_secs(2))
        .with_telemetry_flush_interval(Duration::from_secs(10))
        .with_global_tags(["service:forward-basic"])
        .build()
        .expect("failed to build forwarder");

    // Loop over and over, pretending to do some work.
    for i in 0..600 {
        forwarder.send("demo.loop_iterations:1|c").expect("pipeline closed");
        forwarder.send(format!("demo.queue_depth:{}|g", i % 17)).expect("pipeline closed");

        sleep(Duration::from_millis(100));
    }

    // One last synchronous flush, telemetry included, before tearing down.
    forwarder.flush(true, true).expect("pipeline closed");
    forwarder.close();
}
