use ftpsync_core::Progress;

const BAR_WIDTH: u32 = 20;

/// Status-bar line naming the remotes an action succeeded on.
///
/// `FTPSync [remotes: live,stage]  [=====------ 1/4] > Uploaded  {index.html}`
pub fn progress_message(
    remotes: &[String],
    progress: Option<&Progress>,
    action: &str,
    basename: Option<&str>,
) -> String {
    let mut message = format!("FTPSync [remotes: {}] ", remotes.join(","));

    if let Some(progress) = progress {
        let filled = progress.bar_units(100 / BAR_WIDTH).min(BAR_WIDTH);
        message.push_str(" [");
        message.push_str(&"=".repeat(filled as usize));
        message.push_str(&"--".repeat((BAR_WIDTH - filled) as usize));
        message.push_str(&format!(" {}/{}] ", progress.current(), progress.total()));
    }

    message.push_str("> ");
    message.push_str(action);
    message.push(' ');

    if let Some(basename) = basename {
        message.push_str(&format!(" {{{basename}}}"));
    }
    message
}

/// Summary used once a batch finishes: a single file is named, a batch is counted.
pub fn finished_notice(verb: &str, progress: Option<&Progress>, basename: &str) -> String {
    match progress {
        Some(progress) if progress.total() > 1 => {
            format!("{verb} {} files finished!", progress.total())
        }
        _ => format!("{verb} {{{basename}}} finished!"),
    }
}
