//! Basic usage example for the bridge wire protocol.

use bridge_wire::{
    decode_packet, encode_data_channel, encode_handshake, mesh_query_struct, PacketFramer,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Bridge Wire Protocol Example ===\n");

    // 1. Build the frames a connection sends first
    let endpoint = [0x39, 0x87, 0xC8, 0x57];
    let handshake = encode_handshake(endpoint, b"0123456789abcdef")?;
    let query = encode_data_channel(endpoint, 1, &mesh_query_struct())?;
    println!("1. Handshake: {} bytes, mesh query: {} bytes", handshake.len(), query.len());

    // 2. Simulate a socket delivering them in awkward chunks
    let mut stream = handshake.to_vec();
    stream.extend_from_slice(&query);

    let mut framer = PacketFramer::new();
    let mut raw_frames = Vec::new();
    for chunk in stream.chunks(3) {
        raw_frames.extend(framer.feed(chunk));
    }
    println!("2. Framer extracted {} frames, {} bytes buffered", raw_frames.len(), framer.buffered());

    // 3. Decode them
    for raw in raw_frames {
        let frame = decode_packet(&raw)?;
        println!(
            "3. {:?}: {} payload bytes, inner struct: {:?}",
            frame.packet_type,
            frame.payload.len(),
            frame.inner_struct().map(|s| s.body().len())
        );
    }

    Ok(())
}
