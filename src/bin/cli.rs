//! mixdown CLI: play a test tone through the mixer, or capture it to WAV.
//!
//! Usage:
//!   cargo run --bin md-cli -- --tone 440 --seconds 2
//!   cargo run --bin md-cli -- --loop 11025 22050 --seconds 3
//!   cargo run --bin md-cli -- --buffered --wav output.wav

use md_mixer::{
    samples_to_wav, LoopingContext, ManualBackend, Mixer, MixerConfig, SoundHandle,
};
use md_pcm::{OutputFormat, SampleFormat, SampleSource, SineWaveSource};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, fs, process, thread};

const USAGE: &str = "Usage: md-cli [--config mixer.yaml] [--tone HZ] [--seconds N] \
                     [--loop START FINISH] [--buffered] [--wav output.wav]";

struct Options {
    config: Option<String>,
    tone: f32,
    seconds: u32,
    looping: Option<(u64, u64)>,
    buffered: bool,
    wav: Option<String>,
}

/// The sound being played, plus the looping handle when there is one.
struct Playing {
    handle: Arc<dyn SoundHandle>,
    looping: Option<Arc<LoopingContext>>,
}

fn exit_with(message: impl std::fmt::Display) -> ! {
    eprintln!("{}", message);
    process::exit(1);
}

fn flag_value<'a>(args: &'a [String], flag: &str, offset: usize) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + offset))
        .map(String::as_str)
}

fn parse<T: FromStr>(value: Option<&str>, flag: &str, default: T) -> T {
    match value {
        None => default,
        Some(v) => v
            .parse()
            .unwrap_or_else(|_| exit_with(format!("Invalid value for {}: {}\n{}", flag, v, USAGE))),
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        process::exit(0);
    }

    let looping = if args.iter().any(|a| a == "--loop") {
        let start = flag_value(&args, "--loop", 1);
        let finish = flag_value(&args, "--loop", 2);
        if start.is_none() || finish.is_none() {
            exit_with(USAGE);
        }
        Some((parse(start, "--loop", 0), parse(finish, "--loop", 0)))
    } else {
        None
    };

    Options {
        config: flag_value(&args, "--config", 1).map(str::to_owned),
        tone: parse(flag_value(&args, "--tone", 1), "--tone", 440.0),
        seconds: parse(flag_value(&args, "--seconds", 1), "--seconds", 2),
        looping,
        buffered: args.iter().any(|a| a == "--buffered"),
        wav: flag_value(&args, "--wav", 1).map(str::to_owned),
    }
}

fn main() {
    env_logger::init();
    let options = parse_args();

    let config = match &options.config {
        Some(path) => MixerConfig::load(path)
            .unwrap_or_else(|e| exit_with(format!("Failed to load {}: {}", path, e))),
        None => MixerConfig::default(),
    };
    log::debug!("mixer config: {:?}", config);
    let rate = config.preparing_rates.first().copied().unwrap_or(44100);
    let length = u64::from(rate) * u64::from(options.seconds);
    let source: Arc<dyn SampleSource> = Arc::new(SineWaveSource::new(
        SampleFormat::Mono16,
        rate,
        length,
        options.tone,
        0.5,
    ));

    println!("Tone:     {} Hz", options.tone);
    println!("Rate:     {} Hz", rate);
    println!("Length:   {} samples", length);
    match options.looping {
        Some((start, finish)) => println!("Mode:     looping [{}, {})", start, finish),
        None if options.buffered => println!("Mode:     buffered"),
        None => println!("Mode:     streaming"),
    }
    println!();

    match &options.wav {
        Some(path) => render_to_wav(config, &options, source, rate, path),
        None => play_audio(config, &options, source, rate),
    }
}

fn start(mixer: &Mixer, options: &Options, source: Arc<dyn SampleSource>) -> Playing {
    let playing = if let Some((start, finish)) = options.looping {
        mixer
            .play_looping_sound(source, start, finish, true, 1.0)
            .map(|sound| Playing {
                handle: sound.clone(),
                looping: Some(sound),
            })
    } else if options.buffered {
        mixer
            .play_buffered_sound(source, true, 1.0, false, false)
            .map(|sound| Playing {
                handle: sound,
                looping: None,
            })
    } else {
        mixer.play(source, true, 1.0, false).map(|sound| Playing {
            handle: sound,
            looping: None,
        })
    };
    playing.unwrap_or_else(|| exit_with("Failed to start playback"))
}

/// Release the loop once `elapsed` reaches `limit`.
fn release_loop(playing: &Playing, elapsed: Duration, limit: Duration) {
    if let Some(sound) = &playing.looping {
        if sound.is_looping() && elapsed >= limit {
            sound.stop_looping();
            println!("\rLoop released at sample {}", sound.current_position());
        }
    }
}

fn play_audio(config: MixerConfig, options: &Options, source: Arc<dyn SampleSource>, rate: u32) {
    let mixer = Mixer::new(config).unwrap_or_else(|e| exit_with(format!("Failed to create mixer: {}", e)));
    mixer
        .initialize()
        .unwrap_or_else(|e| exit_with(format!("Failed to initialize mixer: {}", e)));

    let playing = start(&mixer, options, source);
    println!("Playing...");
    println!();

    let started = Instant::now();
    let limit = Duration::from_secs(u64::from(options.seconds));
    while !playing.handle.is_finished() {
        if mixer.stream(rate).is_some_and(|s| s.is_failed()) {
            exit_with(format!("\nOutput stream at {} Hz failed", rate));
        }
        release_loop(&playing, started.elapsed(), limit);
        print!("\rPosition: {:>9}", playing.handle.current_position());
        let _ = std::io::stdout().flush();
        thread::sleep(Duration::from_millis(10));
    }

    println!("\rDone.                    ");
    mixer.shutdown();
}

fn render_to_wav(
    config: MixerConfig,
    options: &Options,
    source: Arc<dyn SampleSource>,
    rate: u32,
    path: &str,
) {
    let channels = config.output_channels;
    let config = config.with_output(channels, OutputFormat::I16);
    let block = config.samples_per_buffer;
    let pace = config.min_signal_interval() * 2;

    let backend = ManualBackend::new();
    let mixer = Mixer::with_backend(config, Arc::new(backend.clone()))
        .unwrap_or_else(|e| exit_with(format!("Failed to create mixer: {}", e)));
    mixer
        .initialize()
        .unwrap_or_else(|e| exit_with(format!("Failed to initialize mixer: {}", e)));
    let playing = start(&mixer, options, source);

    println!("Rendering to {} at {} Hz...", path, rate);
    let loop_frames = rate as usize * options.seconds as usize;
    // A looping tone gets the same length again to play out its tail.
    let max_frames = loop_frames * 2;
    let width = usize::from(channels);
    let mut captured: Vec<i16> = Vec::new();

    while !playing.handle.is_finished() && captured.len() / width < max_frames {
        let frames = captured.len() / width;
        // Offline, time is measured in rendered frames.
        release_loop(
            &playing,
            Duration::from_secs_f64(frames as f64 / f64::from(rate)),
            Duration::from_secs(u64::from(options.seconds)),
        );
        match backend.pump_i16(rate, block) {
            Some(samples) => captured.extend_from_slice(&samples),
            None => exit_with(format!("Output stream at {} Hz is not running", rate)),
        }
        mixer.hint_update();
        thread::sleep(pace);
    }
    mixer.shutdown();

    let wav = samples_to_wav(&captured, channels, rate)
        .unwrap_or_else(|e| exit_with(format!("Failed to encode WAV: {}", e)));
    println!("Rendered {} frames, {} bytes", captured.len() / width, wav.len());

    fs::write(path, &wav).unwrap_or_else(|e| exit_with(format!("Failed to write {}: {}", path, e)));
    println!("Done.");
}
