use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::Receiver;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use opto_rig::{
    ConfigurationError, Error,
    metadata::StimulusMetadata,
    stimulus::{
        DisplayEvent, Mask, RunOutcome, StimulusPlan, StimulusSequencer, StimulusTiming,
    },
};
use rig_sync::SyncMessage;

mod common;
use common::FakeLed;

fn masks() -> Vec<Mask> {
    vec![
        Mask::new(1, "left"),
        Mask::new(2, "right"),
        Mask::new(3, "both"),
    ]
}

fn fast_timing(pulse_ms: u64) -> StimulusTiming {
    StimulusTiming {
        pulse_duration: Duration::from_millis(pulse_ms),
        recording_duration: Duration::from_millis(40),
        interval: Duration::from_millis(60),
        recording_lead: Duration::from_millis(10),
        display_settle: Duration::from_millis(5),
        drain: Duration::from_millis(20),
    }
}

struct Rig {
    sequencer: StimulusSequencer<FakeLed>,
    messages: Receiver<SyncMessage>,
    display: Receiver<DisplayEvent>,
}

fn rig(led: FakeLed, timing: StimulusTiming) -> opto_rig::Result<Rig> {
    let (pub_tx, messages) = crossbeam_channel::unbounded();
    let (display_tx, display) = crossbeam_channel::unbounded();
    let sequencer = StimulusSequencer::new(led, Box::new(display_tx), Box::new(pub_tx), timing)?;
    Ok(Rig {
        sequencer,
        messages,
        display,
    })
}

/// The messages a trial publishes, in order.
fn trial_messages(index: u32) -> [SyncMessage; 3] {
    [
        SyncMessage::TrialIndex(index),
        SyncMessage::StartRecording,
        SyncMessage::StopRecording,
    ]
}

#[test_log::test]
fn completed_run_records_every_trial() -> Result<()> {
    let Rig {
        sequencer,
        messages,
        display,
    } = rig(FakeLed::new(), fast_timing(30))?;
    let plan = StimulusPlan::shuffled(&masks(), 2, &mut ChaCha8Rng::seed_from_u64(7))?;
    let run = sequencer.start(plan.clone())?;
    let completions = run.completions();
    let (sequencer, complete) = run.join()?;

    assert_eq!(completions.try_recv()?, complete);
    assert_eq!(complete.outcome, RunOutcome::Completed);
    assert_eq!(complete.plan, plan);
    assert_eq!(complete.trials.len(), plan.len());
    assert_eq!(sequencer.driver().pulses(), plan.len());
    for (i, (trial, mask)) in complete.trials.iter().zip(plan.trials()).enumerate() {
        assert_eq!(trial.trial_index, i as u32);
        assert_eq!(trial.mask_id, mask.id);
        assert_eq!(trial.mask_name, mask.name);
        assert!(trial.pulse_end >= trial.pulse_start);
        assert!(trial.pulse_duration >= Duration::from_millis(30));
    }

    let expected: Vec<SyncMessage> = (0..plan.len() as u32).flat_map(trial_messages).collect();
    assert_eq!(messages.try_iter().collect::<Vec<_>>(), expected);

    let mut expected: Vec<DisplayEvent> = plan
        .trials()
        .iter()
        .cloned()
        .map(DisplayEvent::Expose)
        .collect();
    expected.push(DisplayEvent::Clear);
    assert_eq!(display.try_iter().collect::<Vec<_>>(), expected);

    let metadata = StimulusMetadata::from_run(&complete, sequencer.timing(), sequencer.driver());
    assert_eq!(metadata.mask_order, plan.mask_names());
    assert_eq!(metadata.pulse_start.len(), plan.len());
    assert!((metadata.interval - 0.06).abs() < 1e-9);
    assert_eq!(metadata.led_name, "fake LED");
    let json = serde_json::to_value(&metadata)?;
    assert_eq!(json["pwm_duty_cycle"], 0.5);
    Ok(())
}

#[test_log::test]
fn interval_shorter_than_recording_is_rejected() {
    let mut timing = fast_timing(10);
    timing.interval = Duration::from_millis(10);
    let r = rig(FakeLed::new(), timing);
    assert!(matches!(
        r.err(),
        Some(Error::Configuration(
            ConfigurationError::IntervalShorterThanRecording { .. }
        ))
    ));
}

#[test_log::test]
fn stop_never_truncates_a_pulse() -> Result<()> {
    let pulse = Duration::from_millis(300);
    let mut timing = fast_timing(300);
    timing.recording_lead = Duration::ZERO;
    timing.display_settle = Duration::ZERO;
    let Rig {
        sequencer,
        messages,
        display,
    } = rig(FakeLed::new(), timing)?;
    let plan = StimulusPlan::sequential(&masks(), 1)?;
    let run = sequencer.start(plan)?;
    let completions = run.completions();

    assert!(matches!(
        display.recv_timeout(Duration::from_secs(5))?,
        DisplayEvent::Expose(_)
    ));
    std::thread::sleep(Duration::from_millis(50));
    run.stop();
    let (_sequencer, complete) = run.join()?;

    assert_eq!(complete.outcome, RunOutcome::Cancelled);
    assert_eq!(completions.try_recv()?, complete);
    assert_eq!(complete.trials.len(), 1);
    let trial = &complete.trials[0];
    assert!(trial.pulse_duration >= pulse);
    let wall = (trial.pulse_end - trial.pulse_start).to_std()?;
    assert!(wall + Duration::from_millis(5) >= pulse, "pulse lasted {wall:?}");

    // The open recording is closed before the run ends.
    assert_eq!(
        messages.try_iter().collect::<Vec<_>>(),
        trial_messages(0).to_vec()
    );
    assert_eq!(display.try_iter().last(), Some(DisplayEvent::Clear));
    Ok(())
}

#[test_log::test]
fn stop_ends_a_wait_early() -> Result<()> {
    let mut timing = fast_timing(10);
    timing.recording_lead = Duration::from_secs(30);
    let Rig {
        sequencer,
        messages,
        display,
    } = rig(FakeLed::new(), timing)?;
    let run = sequencer.start(StimulusPlan::sequential(&masks(), 1)?)?;
    std::thread::sleep(Duration::from_millis(50));
    let t0 = Instant::now();
    run.stop();
    let (sequencer, complete) = run.join()?;
    assert!(t0.elapsed() < Duration::from_secs(1));

    assert_eq!(complete.outcome, RunOutcome::Cancelled);
    assert!(complete.trials.is_empty());
    assert_eq!(sequencer.driver().pulses(), 0);
    assert_eq!(
        messages.try_iter().collect::<Vec<_>>(),
        trial_messages(0).to_vec()
    );
    assert_eq!(
        display.try_iter().collect::<Vec<_>>(),
        vec![DisplayEvent::Clear]
    );
    Ok(())
}

#[test_log::test]
fn hardware_fault_ends_run_with_completion() -> Result<()> {
    let Rig {
        sequencer,
        messages,
        display: _display,
    } = rig(FakeLed::failing_at(1), fast_timing(10))?;
    let run = sequencer.start(StimulusPlan::sequential(&masks(), 1)?)?;
    let completions = run.completions();
    let complete = completions.recv_timeout(Duration::from_secs(10))?;
    let (sequencer, joined) = run.join()?;
    assert_eq!(complete, joined);

    assert!(matches!(
        complete.outcome,
        RunOutcome::Failed(rig_pulse::Error::Hardware(_))
    ));
    assert_eq!(complete.trials.len(), 1);
    assert_eq!(sequencer.driver().pulses(), 2);
    let expected: Vec<SyncMessage> = (0..2).flat_map(trial_messages).collect();
    assert_eq!(messages.try_iter().collect::<Vec<_>>(), expected);
    assert!(matches!(complete.into_result(), Err(Error::Run(_))));
    Ok(())
}

#[test_log::test]
fn shuffled_plans_never_repeat_adjacent_masks() -> Result<()> {
    for seed in 0..50 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for reps in 1..6 {
            let plan = StimulusPlan::shuffled(&masks()[..2], reps, &mut rng)?;
            assert!(plan.mask_ids().windows(2).all(|w| w[0] != w[1]));
        }
    }
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    assert!(matches!(
        StimulusPlan::shuffled(&masks()[..1], 4, &mut rng),
        Err(ConfigurationError::SingleDistinctMask)
    ));
    Ok(())
}
