// Printing from files, capturing uploads and deleting files.
mod common;

use common::Rig;
use krusty_gcodes::PrintStatus;

fn numbered_moves(count: usize) -> String {
    (1..=count).map(|i| format!("G1 X{}\n", i)).collect()
}

#[test]
fn capture_writes_lines_verbatim_until_m29() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("M28 part.g"), "ok Writing to file: part.g");
    assert_eq!(rig.command("G1 X10 ; move"), "ok");
    assert_eq!(rig.command("G28"), "ok");
    assert_eq!(rig.command("M29"), "ok Done saving file.");

    assert_eq!(rig.sim.files.contents("gcodes/part.g").as_deref(), Some("G1 X10 ; move\nG28\n"));
    assert!(rig.sim.motion.executed().is_empty());
    assert_eq!(rig.sim.files.open_count(), 0);

    // Back to executing.
    rig.command("G1 X10");
    rig.ticks(3);
    assert_eq!(rig.executed_x(), vec![10.0]);
}

#[test]
fn m29_needs_an_upload_on_the_same_source() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("M29"), "Error: M29 while no file is being written from this source");

    rig.sim.serial.send("M28 part.g\n");
    rig.ticks(2);
    // The network cannot end the serial upload.
    assert_eq!(rig.command("M29"), "Error: M29 while no file is being written from this source");
    rig.sim.serial.send("G1 X1\nM29\n");
    rig.ticks(4);
    assert_eq!(rig.sim.serial.replies, vec!["ok Writing to file: part.g", "ok", "ok Done saving file."]);
    assert_eq!(rig.sim.files.contents("gcodes/part.g").as_deref(), Some("G1 X1\n"));
}

#[test]
fn only_one_capture_at_a_time() {
    let mut rig = Rig::new();
    rig.command("M28 a.g");
    rig.sim.serial.send("M28 b.g\n");
    rig.ticks(2);
    assert_eq!(rig.sim.serial.replies, vec!["Error: M28 cannot run while another command is in progress"]);
    rig.command("M29");
    assert!(!rig.sim.files.exists("gcodes/b.g"));
}

#[test]
fn selected_file_prints_to_completion() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/part.g", &numbered_moves(3));
    assert_eq!(rig.command("M23 part.g"), "ok File part.g selected");
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Selected));
    assert_eq!(rig.command("M24"), "ok");
    assert!(rig.dispatcher.is_printing());

    rig.ticks(20);
    assert_eq!(rig.executed_x(), vec![1.0, 2.0, 3.0]);
    assert!(!rig.dispatcher.is_printing());
    let job = rig.dispatcher.print_job().expect("job");
    assert_eq!(job.status, PrintStatus::Completed);
    assert_eq!(job.progress, 1.0);
    assert_eq!(job.file_path, "gcodes/part.g");
    assert_eq!(rig.command("M27"), "ok Not SD printing.");
    assert_eq!(rig.sim.files.open_count(), 0);
}

#[test]
fn carriage_return_only_file_prints_every_line() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/cr.g", "G1 X1\rG1 X2\rG1 X3\r");
    rig.command("M23 cr.g");
    rig.command("M24");
    rig.ticks(40);
    assert_eq!(rig.executed_x(), vec![1.0, 2.0, 3.0]);
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Completed));
}

#[test]
fn pause_and_resume() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/long.g", &numbered_moves(20));
    rig.command("M23 long.g");
    rig.command("M24");
    rig.ticks(4);

    let paused = rig.command("M25");
    assert!(paused.starts_with("ok Print paused at"), "{}", paused);
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Paused));
    rig.ticks(5);
    let moves = rig.sim.motion.executed().len();
    rig.ticks(10);
    assert_eq!(rig.sim.motion.executed().len(), moves);
    assert!(moves < 20);
    assert!(rig.command("M27").starts_with("ok Print paused at"));

    assert_eq!(rig.command("M24"), "ok");
    assert!(rig.command("M27").starts_with("ok SD printing byte"));
    rig.ticks(80);
    assert_eq!(rig.executed_x().last(), Some(&20.0));
    assert_eq!(rig.executed_x().len(), 20);
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Completed));
}

#[test]
fn m0_cancels_a_print() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/long.g", &numbered_moves(20));
    rig.command("M23 long.g");
    rig.command("M24");
    rig.ticks(3);
    assert_eq!(rig.command("M0"), "ok");
    assert!(!rig.dispatcher.is_printing());
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Cancelled));
    assert_eq!(rig.command("M24"), "Error: file not found: no file selected for printing");
    assert_eq!(rig.sim.files.open_count(), 0);
}

#[test]
fn queued_file_prints_from_the_api() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/api.g", "G1 X7\n");
    {
        let mut io = rig.sim.peripherals();
        let missing = rig.dispatcher.queue_file_to_print("none.g", &mut io).unwrap_err();
        assert_eq!(missing.to_string(), "file not found: gcodes/none.g");
        rig.dispatcher.queue_file_to_print("api.g", &mut io).unwrap();
    }
    rig.ticks(6);
    assert_eq!(rig.executed_x(), vec![7.0]);
    assert_eq!(rig.dispatcher.print_job().map(|j| j.status), Some(PrintStatus::Completed));
}

#[test]
fn m30_deletes_files() {
    let mut rig = Rig::new();
    rig.sim.files.insert("gcodes/old.g", "G28\n");
    assert_eq!(rig.command("M30 old.g"), "ok");
    assert!(!rig.sim.files.exists("gcodes/old.g"));
    assert_eq!(rig.command("M30 old.g"), "Error: file not found: gcodes/old.g");
}

#[test]
fn web_page_upload_over_serial() {
    let mut rig = Rig::new();
    rig.sim.serial.send("M560\n<html>\n<b>hi</b>\n</html>");
    rig.ticks(3);
    assert_eq!(rig.sim.serial.replies, vec!["ok", "ok Done saving file."]);
    assert_eq!(rig.sim.files.contents("www/reprap.htm").as_deref(), Some("<html>\n<b>hi</b>\n</html>"));

    // Ordinary commands work again afterwards.
    rig.sim.serial.send("M115\n");
    rig.ticks(2);
    assert_eq!(rig.sim.serial.replies.len(), 3);
}

#[test]
fn web_page_upload_needs_the_serial_line() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("M560"), "Error: unsupported command M560 from network");
    assert!(!rig.sim.files.exists("www/reprap.htm"));
}
