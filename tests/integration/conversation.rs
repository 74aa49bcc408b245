//! End-to-end conversational turns through scripted stage backends.

use crate::helpers::{
    Harness, LlmScript, RecordingSink, SttScript, TtsScript, channel_io, collect_for,
    collect_until, feed, frames, is_turn_completed, shape, test_config,
};
use std::sync::atomic::Ordering;
use std::time::Duration;
use talkloop::audio::WavFileSource;
use talkloop::{AudioIo, PipelineEvent, SessionConfig, SessionState, Stage};

#[tokio::test]
async fn test_full_turn_event_order() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let session = harness
        .orchestrator
        .connect(test_config(), io)
        .await
        .unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 2_000, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;

    assert_eq!(
        shape(&events),
        vec![
            "pipelineStarted",
            "vadSpeechStart",
            "vadSpeechEnd",
            "sttPartialTranscript",
            "sttFinalTranscript",
            "llmThinking",
            "llmPartialResponse",
            "llmFinalResponse",
            "ttsStarted",
            "ttsProgress",
            "ttsCompleted",
            "turnCompleted",
        ],
        "unexpected event order"
    );
    assert_eq!(session.state(), SessionState::Listening);

    let final_transcripts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::SttFinalTranscript(segment) => Some(segment.text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(final_transcripts, vec!["what is the weather"]);

    let response = events.iter().find_map(|e| match e {
        PipelineEvent::LlmFinalResponse(chunk) => Some(chunk.text.clone()),
        _ => None,
    });
    assert_eq!(response.as_deref(), Some("It is sunny today."));
    assert_eq!(
        harness.tts_texts.lock().unwrap().as_slice(),
        ["It is sunny today.".to_owned()]
    );

    let completed = events.iter().find_map(|e| match e {
        PipelineEvent::TtsCompleted { audio } => Some(audio.samples.len()),
        _ => None,
    });
    assert_eq!(completed, Some(3 * 480), "completed audio is the whole response");
}

#[tokio::test]
async fn test_transcript_goes_straight_to_tts_without_llm() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let config = SessionConfig {
        use_llm: false,
        ..test_config()
    };
    let session = harness.orchestrator.connect(config, io).await.unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 2_000, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;

    assert_eq!(
        shape(&events),
        vec![
            "pipelineStarted",
            "vadSpeechStart",
            "vadSpeechEnd",
            "sttPartialTranscript",
            "sttFinalTranscript",
            "ttsStarted",
            "ttsProgress",
            "ttsCompleted",
            "turnCompleted",
        ]
    );
    assert_eq!(harness.llm.initialized(), 0, "LLM must not be loaded");
    assert_eq!(
        harness.tts_texts.lock().unwrap().as_slice(),
        ["what is the weather".to_owned()]
    );

    // The transcript still passes through processing before speaking.
    let states: Vec<_> = crate::helpers::state_changes(&events)
        .into_iter()
        .map(|(_, to)| to)
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Speaking,
            SessionState::Listening,
        ]
    );
}

#[tokio::test]
async fn test_history_is_passed_to_later_turns() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let config = SessionConfig {
        max_history_turns: 1,
        ..test_config()
    };
    let session = harness.orchestrator.connect(config, io).await.unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    let mut at = Duration::ZERO;
    for _ in 0..3 {
        let utterance = frames(at, 600, 1_000);
        at += Duration::from_millis(1_600);
        feed(&tx, utterance).await;
        collect_until(&mut sub, is_turn_completed).await;
    }

    let requests = harness.llm_requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].history.is_empty());
    assert_eq!(requests[1].history.len(), 1);
    assert_eq!(requests[2].history.len(), 1, "history window is bounded");
    assert_eq!(requests[2].history[0].assistant_text, "It is sunny today.");
    assert_eq!(requests[2].language, "en-US");
}

#[tokio::test]
async fn test_empty_transcript_ends_turn_without_response() {
    let harness = Harness::new(
        SttScript {
            partials: Vec::new(),
            text: "   ".into(),
            ..SttScript::default()
        },
        LlmScript::default(),
        TtsScript::default(),
    );
    let (tx, io) = channel_io();
    let session = harness.orchestrator.connect(test_config(), io).await.unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 600, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;

    assert_eq!(
        shape(&events),
        vec![
            "pipelineStarted",
            "vadSpeechStart",
            "vadSpeechEnd",
            "sttFinalTranscript",
            "turnCompleted",
        ]
    );
    assert_eq!(harness.llm.invoked(), 0);
    assert_eq!(session.state(), SessionState::Listening);
}

#[tokio::test]
async fn test_partial_responses_suppressed_without_streaming() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let config = SessionConfig {
        enable_streaming: false,
        enable_tts: false,
        ..test_config()
    };
    let session = harness.orchestrator.connect(config, io).await.unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 600, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;
    let names = shape(&events);

    assert!(!names.contains(&"llmPartialResponse"));
    assert!(names.contains(&"llmFinalResponse"));
    assert!(!names.contains(&"ttsStarted"), "TTS is not configured");
    assert_eq!(harness.tts.initialized(), 0);
    assert_eq!(session.state(), SessionState::Listening);
}

#[tokio::test]
async fn test_synthesized_audio_reaches_playback() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let sink = RecordingSink::default();
    let session = harness
        .orchestrator
        .connect(test_config(), io.with_playback(sink.clone()))
        .await
        .unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 600, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;

    let progress: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TtsProgress {
                fraction_complete, ..
            } => Some(*fraction_complete),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!((progress[2] - 1.0).abs() < f32::EPSILON);
    assert_eq!(sink.played.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_vad_disabled_finalizes_at_max_length() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let mut config = SessionConfig {
        enable_vad: false,
        ..test_config()
    };
    config.vad.max_utterance_duration_ms = 1_000;
    let session = harness.orchestrator.open_session(config).unwrap();
    let mut sub = session.subscribe();
    session.connect(io).await.unwrap();
    session.start_listening().await.unwrap();

    // Silence is speech when VAD is off.
    feed(&tx, frames(Duration::ZERO, 0, 1_000)).await;
    let events = collect_until(&mut sub, is_turn_completed).await;

    assert!(
        !events
            .iter()
            .any(|e| matches!(e, PipelineEvent::ComponentInitializing(Stage::Vad))),
        "VAD must not be initialized"
    );
    assert!(shape(&events).contains(&"sttFinalTranscript"));
    assert_eq!(harness.stt.invoked(), 1);
}

#[tokio::test]
async fn test_exhausted_source_flushes_open_utterance() {
    let harness = Harness::scripted();
    let (tx, io) = channel_io();
    let config = SessionConfig {
        enable_vad: false,
        ..test_config()
    };
    let session = harness.orchestrator.connect(config, io).await.unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    feed(&tx, frames(Duration::ZERO, 600, 0)).await;
    drop(tx);
    let events = collect_until(&mut sub, is_turn_completed).await;

    assert_eq!(harness.stt.invoked(), 1);
    assert!(shape(&events).contains(&"vadSpeechEnd"));
    let rest = collect_for(&mut sub, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "nothing follows exhaustion: {rest:?}");
    assert_eq!(session.state(), SessionState::Listening);
}

#[tokio::test]
async fn test_wav_file_drives_a_turn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("question.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for chunk in frames(Duration::ZERO, 1_000, 1_000) {
        for &s in chunk.samples.iter() {
            writer.write_sample((s * 32_767.0) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();

    let harness = Harness::scripted();
    let source = WavFileSource::open(&path, 20).unwrap();
    let session = harness
        .orchestrator
        .connect(test_config(), AudioIo::new(source))
        .await
        .unwrap();
    let mut sub = session.subscribe();
    session.start_listening().await.unwrap();

    let events = collect_until(&mut sub, is_turn_completed).await;
    assert!(shape(&events).contains(&"ttsCompleted"));
    assert_eq!(harness.stt.invoked(), 1);
}
