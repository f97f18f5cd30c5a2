//! WAV encoding for 16-bit PCM captured from a stream.

use std::io::Write;

/// Write interleaved 16-bit samples as a PCM WAV file.
pub fn write_wav(
    w: &mut impl Write,
    samples: &[i16],
    channels: u16,
    sample_rate: u32,
) -> std::io::Result<()> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;

    write_riff_header(w, data_size)?;
    write_fmt_chunk(w, channels, sample_rate, block_align, bits_per_sample)?;
    write_data_chunk(w, samples, data_size)
}

pub fn samples_to_wav(samples: &[i16], channels: u16, sample_rate: u32) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(44 + samples.len() * 2);
    write_wav(&mut buf, samples, channels, sample_rate)?;
    Ok(buf)
}

fn write_riff_header(w: &mut impl Write, data_size: u32) -> std::io::Result<()> {
    w.write_all(b"RIFF")?;
    w.write_all(&(36 + data_size).to_le_bytes())?;
    w.write_all(b"WAVE")
}

fn write_fmt_chunk(
    w: &mut impl Write,
    channels: u16,
    sample_rate: u32,
    block_align: u16,
    bits_per_sample: u16,
) -> std::io::Result<()> {
    w.write_all(b"fmt ")?;
    w.write_all(&16u32.to_le_bytes())?;
    w.write_all(&1u16.to_le_bytes())?;
    w.write_all(&channels.to_le_bytes())?;
    w.write_all(&sample_rate.to_le_bytes())?;
    w.write_all(&(sample_rate * block_align as u32).to_le_bytes())?;
    w.write_all(&block_align.to_le_bytes())?;
    w.write_all(&bits_per_sample.to_le_bytes())
}

fn write_data_chunk(w: &mut impl Write, samples: &[i16], data_size: u32) -> std::io::Result<()> {
    w.write_all(b"data")?;
    w.write_all(&data_size.to_le_bytes())?;
    for sample in samples {
        w.write_all(&sample.to_le_bytes())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_describes_stereo_16_bit() {
        let wav = samples_to_wav(&[1, -1, 2, -2], 2, 44100).unwrap();
        assert_eq!(wav.len(), 44 + 8);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wav[4..8].try_into().unwrap()), 36 + 8);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 2);
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 44100);
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 44100 * 4);
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 4);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), -1);
    }

    #[test]
    fn data_chunk_holds_the_interleaved_samples() {
        let samples = [0, 1, -1, i16::MAX, i16::MIN, 12345, -12345, 7];
        let mut wav = Vec::new();
        write_wav(&mut wav, &samples, 2, 48000).unwrap();

        let size = u32::from_le_bytes(wav[40..44].try_into().unwrap()) as usize;
        assert_eq!(size, samples.len() * 2);
        let decoded: Vec<i16> = wav[44..44 + size]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded, samples);
        assert_eq!(wav.len(), 44 + size);
    }

    #[test]
    fn mono_block_align() {
        let wav = samples_to_wav(&[0; 10], 1, 22050).unwrap();
        assert_eq!(u16::from_le_bytes([wav[32], wav[33]]), 2);
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 20);
    }
}
