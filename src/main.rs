use clap::Parser;
use skiff::torrent::{Torrent, TorrentEvent};
use skiff::utils::format_bytes;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short, long, help = "path to *.torrent file")]
    file: PathBuf,
    #[clap(short, long, default_value = "6881")]
    port: u16,
    #[clap(short, long, help = "directory to download into", default_value = ".")]
    out: PathBuf,
}

fn main() {
    let args = Cli::parse();

    let mut torrent = Torrent::new(args.out, args.port);
    let events = torrent.subscribe();
    torrent.load_file(&args.file);

    let mut already_complete = false;
    for event in events.try_iter() {
        match event {
            TorrentEvent::Error => {
                if let Some(e) = torrent.last_error() {
                    eprintln!("failed to load torrent: {:#}", e);
                }
                std::process::exit(1);
            }
            TorrentEvent::Complete => already_complete = true,
            _ => {}
        }
    }

    println!(
        "{}: {} in {} pieces of {}",
        torrent.name(),
        format_bytes(torrent.size()),
        torrent.num_pieces(),
        format_bytes(torrent.piece_length() as u64),
    );
    if already_complete {
        println!("all pieces already on disk, seeding");
    }

    torrent.start();
    loop {
        torrent.step(Duration::from_millis(500));
        for event in events.try_iter() {
            match event {
                TorrentEvent::Progress(fraction) => {
                    println!("{:5.1}% of {}", fraction * 100.0, torrent.name());
                }
                TorrentEvent::Complete => {
                    println!("{} complete", torrent.name());
                    torrent.stop();
                    return;
                }
                TorrentEvent::Updated => {
                    println!(
                        "swarm: {} seeders / {} leechers, {} peers, down {}/s up {}/s",
                        torrent.seeders(),
                        torrent.leechers(),
                        torrent.list_peers().len(),
                        format_bytes(torrent.calculate_download_rate() as u64),
                        format_bytes(torrent.calculate_upload_rate() as u64),
                    );
                }
                _ => {}
            }
        }
    }
}
