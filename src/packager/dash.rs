//! DASH MPD writer
//!
//! Renders the media presentation description with a proper XML writer
//! rather than textual mutation. Dynamic manifests advertise an update
//! period and the availability start time; finalization swaps the
//! presentation to static and replaces the update period with the
//! total media duration.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::io::Cursor;

use super::manifest::{ManifestMode, ManifestState, SegmentRef};
use crate::watcher::TrackKind;

const MPD_NS: &str = "urn:mpeg:dash:schema:mpd:2011";
const PROFILE_ISOFF_LIVE: &str = "urn:mpeg:dash:profile:isoff-live:2011";
const TIMESCALE: u64 = 1000;

/// ISO 8601 duration with millisecond precision
fn iso_duration(secs: f64) -> String {
    format!("PT{:.3}S", secs.max(0.0))
}

pub(crate) fn render_mpd(state: &ManifestState) -> std::io::Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    let mut mpd = BytesStart::new("MPD");
    mpd.push_attribute(("xmlns", MPD_NS));
    mpd.push_attribute(("profiles", PROFILE_ISOFF_LIVE));
    mpd.push_attribute(("minBufferTime", "PT4S"));
    match state.mode {
        ManifestMode::Dynamic => {
            mpd.push_attribute(("type", "dynamic"));
            mpd.push_attribute(("minimumUpdatePeriod", "PT2S"));
            mpd.push_attribute((
                "availabilityStartTime",
                state.availability_start.to_rfc3339().as_str(),
            ));
        }
        ManifestMode::Static => {
            mpd.push_attribute(("type", "static"));
            mpd.push_attribute((
                "mediaPresentationDuration",
                iso_duration(state.presentation_duration()).as_str(),
            ));
        }
    }
    writer.write_event(Event::Start(mpd))?;

    let mut period = BytesStart::new("Period");
    period.push_attribute(("id", "0"));
    period.push_attribute(("start", "PT0S"));
    writer.write_event(Event::Start(period))?;

    // Video adaptation set: one representation per profile
    let mut video_set = BytesStart::new("AdaptationSet");
    video_set.push_attribute(("contentType", "video"));
    video_set.push_attribute(("segmentAlignment", "true"));
    writer.write_event(Event::Start(video_set))?;
    for profile in &state.params.video_profiles {
        let segments = state
            .track(TrackKind::Video, Some(&profile.name))
            .map(|t| t.admitted.as_slice())
            .unwrap_or(&[]);
        let codecs = super::codec::video_codec_string(&state.params.video_codec, profile);

        let mut representation = BytesStart::new("Representation");
        representation.push_attribute(("id", format!("video-{}", profile.name).as_str()));
        representation.push_attribute(("mimeType", "video/mp4"));
        representation.push_attribute(("codecs", codecs.as_str()));
        representation.push_attribute(("width", profile.width.to_string().as_str()));
        representation.push_attribute(("height", profile.height.to_string().as_str()));
        representation.push_attribute((
            "bandwidth",
            (profile.video_bitrate as u64 * 1000).to_string().as_str(),
        ));
        writer.write_event(Event::Start(representation))?;
        write_segment_template(
            &mut writer,
            &format!("init/video-{}.mp4", profile.name),
            &format!("segments/video-{}-$Number$.m4s", profile.name),
            segments,
        )?;
        writer.write_event(Event::End(BytesEnd::new("Representation")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("AdaptationSet")))?;

    // Audio adaptation set, present once audio segments exist
    let audio_segments = state
        .track(TrackKind::Audio, None)
        .map(|t| t.admitted.as_slice())
        .unwrap_or(&[]);
    if !audio_segments.is_empty() {
        let mut audio_set = BytesStart::new("AdaptationSet");
        audio_set.push_attribute(("contentType", "audio"));
        audio_set.push_attribute(("segmentAlignment", "true"));
        writer.write_event(Event::Start(audio_set))?;

        let mut representation = BytesStart::new("Representation");
        representation.push_attribute(("id", "audio"));
        representation.push_attribute(("mimeType", "audio/mp4"));
        representation.push_attribute((
            "codecs",
            super::codec::audio_codec_string(&state.params.audio_codec),
        ));
        representation.push_attribute((
            "bandwidth",
            (state.params.audio_bitrate as u64 * 1000).to_string().as_str(),
        ));
        writer.write_event(Event::Start(representation))?;
        write_segment_template(
            &mut writer,
            "init/audio.mp4",
            "segments/audio-$Number$.m4s",
            audio_segments,
        )?;
        writer.write_event(Event::End(BytesEnd::new("Representation")))?;
        writer.write_event(Event::End(BytesEnd::new("AdaptationSet")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Period")))?;
    writer.write_event(Event::End(BytesEnd::new("MPD")))?;

    Ok(writer.into_inner().into_inner())
}

fn write_segment_template<W: std::io::Write>(
    writer: &mut Writer<W>,
    initialization: &str,
    media: &str,
    segments: &[SegmentRef],
) -> std::io::Result<()> {
    let mut template = BytesStart::new("SegmentTemplate");
    template.push_attribute(("timescale", TIMESCALE.to_string().as_str()));
    template.push_attribute(("initialization", initialization));
    template.push_attribute(("media", media));
    template.push_attribute(("startNumber", "0"));
    writer.write_event(Event::Start(template))?;

    writer.write_event(Event::Start(BytesStart::new("SegmentTimeline")))?;
    let mut t = 0u64;
    for segment in segments {
        let d = (segment.duration_secs * TIMESCALE as f64).round() as u64;
        let mut s = BytesStart::new("S");
        if segment.index == 0 {
            s.push_attribute(("t", t.to_string().as_str()));
        }
        s.push_attribute(("d", d.to_string().as_str()));
        writer.write_event(Event::Empty(s))?;
        t += d;
    }
    writer.write_event(Event::End(BytesEnd::new("SegmentTimeline")))?;
    writer.write_event(Event::End(BytesEnd::new("SegmentTemplate")))?;
    Ok(())
}
