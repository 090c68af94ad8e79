use super::*;
use crate::sync::test_support::{Project, at};
use ftpsync_core::parse_config;

const LIVE: &str = r#"{ "live": { "host": "live.example", "path": "/www" } }"#;

fn labels(rows: &[Vec<String>]) -> Vec<&str> {
    rows.iter().map(|row| row[0].as_str()).collect()
}

fn remote_tree(project: &Project) {
    project.server.add_dir("live", "/www");
    project.server.add_dir("live", "/www/css");
    project.server.add_file("live", "/www/b.txt", at(10), 5);
    project.server.add_file("live", "/www/A.txt", at(20), 2048);
}

#[tokio::test]
async fn listing_puts_parent_then_folders_then_files() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    assert_eq!(sync.browse(project.root()).await, BrowseOutcome::Dismissed);

    let listing = &project.prompter.shown()[0];
    assert_eq!(labels(listing), ["[ .. ]", "[ . ]", "[ css ]", "A.txt", "b.txt"]);
    assert_eq!(
        listing[3],
        vec!["A.txt", "Size: 2 kB", "Last modified: 1970-01-01 00:00", "Path: /www"]
    );
    assert_eq!(project.server.calls_of("list"), vec!["live:/www"]);
    assert_eq!(project.server.calls().last().map(String::as_str), Some("live:close"));
}

#[tokio::test]
async fn remote_root_has_no_parent_entry() {
    let project = Project::new(r#"{ "live": { "host": "live.example", "path": "/" } }"#);
    project.server.add_dir("live", "/");
    project.server.add_file("live", "/index.html", at(10), 1);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    sync.browse(project.root()).await;
    assert_eq!(labels(&project.prompter.shown()[0]), ["[ . ]", "index.html"]);
}

#[tokio::test]
async fn several_profiles_ask_which_one_to_browse() {
    let project = Project::new(
        r#"{
            "live": { "host": "live.example", "path": "/www" },
            "stage": { "host": "stage.example", "path": "/site" }
        }"#,
    );
    project.server.add_dir("stage", "/site");
    project.prompter.answer_choice(Some(1));
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    sync.browse(project.root()).await;
    assert_eq!(
        project.prompter.shown()[0],
        vec![
            vec!["live", "Host: live.example", "Path: /www"],
            vec!["stage", "Host: stage.example", "Path: /site"],
        ]
    );
    assert_eq!(project.server.calls_of("list"), vec!["stage:/site"]);
}

#[tokio::test]
async fn opened_folder_is_where_browse_last_resumes() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // css, then "Open css"
    project.prompter.answer_choice(Some(2));
    project.prompter.answer_choice(Some(0));
    sync.browse(project.root()).await;
    assert_eq!(
        project.prompter.shown()[1],
        vec![
            vec!["Open css"],
            vec!["Back"],
            vec!["Download folder"],
            vec!["Remove folder"],
            vec!["Rename folder"],
            vec!["Change permissions"],
            vec!["Show details"],
        ]
    );

    assert_eq!(sync.browse_last().await, BrowseOutcome::Dismissed);
    assert_eq!(
        project.server.calls_of("list"),
        vec!["live:/www", "live:/www/css", "live:/www/css"]
    );
}

#[tokio::test]
async fn browse_last_needs_a_previous_session() {
    let project = Project::new(LIVE);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    assert_eq!(sync.browse_last().await, BrowseOutcome::NothingToResume);
    assert!(project.server.calls().is_empty());
}

#[tokio::test]
async fn downloading_a_file_without_local_copy() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // b.txt, then "Download file"
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(1));
    let outcome = sync.browse(project.root()).await;

    assert!(matches!(
        outcome,
        BrowseOutcome::Downloaded(Outcome::Done(ref report)) if report.succeeded == ["live"]
    ));
    assert_eq!(
        std::fs::read_to_string(project.root().join("b.txt")).unwrap(),
        "live:/www/b.txt"
    );
    assert_eq!(labels(&project.prompter.shown()[1])[..3], ["Back", "Download file", "Remove file"]);
}

#[tokio::test]
async fn changing_permissions_reports_the_new_mode() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // b.txt, then "Change permissions"
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_text(Some("644"));
    let outcome = sync.browse(project.root()).await;

    assert_eq!(
        outcome,
        BrowseOutcome::PermissionsChanged {
            remote: "/www/b.txt".into(),
            mode: "644".into()
        }
    );
    assert_eq!(project.prompter.asked(), vec!["Change permissions to:"]);
    assert_eq!(project.server.calls_of("chmod"), vec!["live:/www/b.txt:644"]);
    assert!(
        project
            .prompter
            .statuses()
            .contains(&"Properties of b.txt changed to 644".to_string())
    );
}

#[tokio::test]
async fn invalid_permissions_change_nothing() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_text(Some("rwz"));

    assert!(matches!(sync.browse(project.root()).await, BrowseOutcome::Failed(_)));
    assert!(project.server.calls_of("chmod").is_empty());
}

#[tokio::test]
async fn removing_a_remote_only_file_asks_first() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // b.txt, "Remove file", then confirm
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(2));
    project.prompter.answer_choice(Some(0));
    let outcome = sync.browse(project.root()).await;

    assert_eq!(outcome, BrowseOutcome::RemovedRemotely("/www/b.txt".into()));
    assert!(!project.server.has("live", "/www/b.txt"));
    assert_eq!(project.prompter.shown()[2][1][0], "No");
}

#[tokio::test]
async fn renaming_a_remote_only_file_stays_in_its_folder() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // b.txt, then "Rename file"
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(3));
    project.prompter.answer_text(Some("c.txt"));
    let outcome = sync.browse(project.root()).await;

    assert_eq!(
        outcome,
        BrowseOutcome::RenamedRemotely {
            from: "/www/b.txt".into(),
            to: "/www/c.txt".into()
        }
    );
    assert!(project.server.has("live", "/www/c.txt"));
    assert_eq!(project.prompter.asked(), vec!["New name:"]);
}

#[tokio::test]
async fn details_describe_both_copies() {
    let project = Project::new(LIVE);
    project.write("a.txt", "a");
    project.server.add_dir("live", "/www");
    project.server.add_file("live", "/www/a.txt", at(10), 1);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // a.txt, then "Show details"
    project.prompter.answer_choice(Some(2));
    project.prompter.answer_choice(Some(6));
    let BrowseOutcome::Details(rows) = sync.browse(project.root()).await else {
        panic!("expected details");
    };

    assert_eq!(
        labels(&project.prompter.shown()[1]),
        [
            "Back",
            "Download file",
            "Upload file",
            "Remove file",
            "Rename file",
            "Change permissions",
            "Show details"
        ]
    );
    assert_eq!(
        rows[..8],
        [
            "a.txt",
            "[File]",
            "Path: /a.txt",
            "Size: 0.001 kB",
            "Last Modified: 1970-01-01 00:00",
            "",
            "[Has local version]",
            "Local size: 0.001 kB",
        ]
    );
    assert!(rows[8].starts_with("Local last modified: "));
    assert_eq!(project.prompter.shown().last(), Some(&vec![rows.clone()]));
}

#[tokio::test]
async fn back_returns_to_the_same_listing() {
    let project = Project::new(LIVE);
    remote_tree(&project);
    let sync = Synchronizer::new(Arc::clone(&project.ctx));

    // b.txt, "Back", then dismiss the listing
    project.prompter.answer_choice(Some(4));
    project.prompter.answer_choice(Some(0));
    assert_eq!(sync.browse(project.root()).await, BrowseOutcome::Dismissed);
    assert_eq!(project.server.calls_of("list"), vec!["live:/www", "live:/www"]);
}

#[test]
fn new_settings_writes_the_template_once() {
    let project = Project::new(LIVE);
    let sub = project.root().join("sub");
    std::fs::create_dir_all(&sub).unwrap();
    let page = sub.join("page.html");
    let sync = Synchronizer::new(Arc::clone(&project.ctx));
    assert_eq!(project.ctx.config_file_for(&page), Some(project.config_file()));

    let written = sync.new_settings(&[sub.clone()]).unwrap();
    let config_file = sub.join(CONFIG_FILE_NAME);
    assert_eq!(written, vec![config_file.clone()]);
    let contents = std::fs::read_to_string(&config_file).unwrap();
    assert_eq!(contents, DEFAULT_SETTINGS_TEMPLATE);
    assert!(parse_config(&config_file, &contents).is_ok());
    assert_eq!(project.ctx.config_file_for(&page), Some(config_file.clone()));

    std::fs::write(&config_file, LIVE).unwrap();
    sync.new_settings(&[sub]).unwrap();
    assert_eq!(std::fs::read_to_string(&config_file).unwrap(), LIVE);
}

#[test]
fn parent_and_segment_of_remote_paths() {
    assert_eq!(parent_of("/www/css"), "/www");
    assert_eq!(parent_of("/www"), "/");
    assert_eq!(parent_of("/"), "/");
    assert_eq!(last_segment("/www/css/"), "css");
    assert_eq!(last_segment("/"), "/");
    assert_eq!(relative_to("/www/", "/www/a.txt"), "/a.txt");
    assert_eq!(relative_to("/www", "/www"), "/");
}
