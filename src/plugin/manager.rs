//! Plugin resolution and option priming.
//!
//! Maps each URL to the plugins that claim it, lets the user pick when more
//! than one does, and fills the option bags from `-o key=value` pairs plus
//! interactive prompts (unless prompting is disabled).

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use super::options::{OptionSet, PluginOption};
use super::Plugin;

#[derive(Debug, Error)]
pub enum PluginSetupError {
    #[error("no plugins to select from")]
    NoPlugins,
    #[error("unintelligible number")]
    NotANumber,
    #[error("index out of range")]
    OutOfRange,
    #[error("a required plugin option was not set and prompting is off")]
    UnsetRequired,
    #[error("a required plugin option cannot be hidden")]
    RequiredHidden,
    #[error(transparent)]
    BadOption(#[from] super::options::OptionParseError),
}

pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// All plugins claiming each URL, in registration order.
    pub fn find_handlers(&self, urls: &[String]) -> Vec<Vec<Arc<dyn Plugin>>> {
        urls.iter()
            .map(|url| {
                self.plugins
                    .iter()
                    .filter(|p| p.can_handle(url))
                    .cloned()
                    .collect()
            })
            .collect()
    }

    /// Returns the plugin when exactly one matched, otherwise asks the user.
    pub fn select_plugin(
        handlers: &[Arc<dyn Plugin>],
    ) -> Result<Arc<dyn Plugin>, PluginSetupError> {
        match handlers {
            [] => Err(PluginSetupError::NoPlugins),
            [only] => Ok(Arc::clone(only)),
            _ => {
                println!("Found multiple handlers. Please select one:");
                for (i, p) in handlers.iter().enumerate() {
                    println!("  {:2}) {}", i + 1, plugin_label(p.as_ref()));
                }
                let n: usize = prompt("Desired plugin")
                    .parse()
                    .map_err(|_| PluginSetupError::NotANumber)?;
                if n < 1 || n > handlers.len() {
                    return Err(PluginSetupError::OutOfRange);
                }
                Ok(Arc::clone(&handlers[n - 1]))
            }
        }
    }

    /// Prime every handler's options from the user-supplied pairs, prompting
    /// for what is missing. With `defaults` only required slots are prompted;
    /// with `no_prompt` an unset required slot is fatal.
    pub fn set_options(
        &self,
        handlers: &[Arc<dyn Plugin>],
        user: &HashMap<String, String>,
        defaults: bool,
        no_prompt: bool,
    ) -> Result<(), PluginSetupError> {
        let mut unset: Vec<(&Arc<dyn Plugin>, Vec<PluginOption>)> = Vec::new();
        let mut unset_required: Vec<(&Arc<dyn Plugin>, Vec<PluginOption>)> = Vec::new();

        for plugin in handlers {
            let opts = plugin.options();
            let mut plain = Vec::new();
            let mut required = Vec::new();
            for slot in opts.snapshot() {
                let mut set = false;
                for (key, value) in user {
                    if slot.key.eq_ignore_ascii_case(key) {
                        opts.set(key, value)?;
                        set = true;
                        debug!(plugin = plugin.name(), key = slot.key, value = %value, "set option");
                    }
                }
                if !set {
                    if slot.required {
                        if slot.is_hidden() {
                            return Err(PluginSetupError::RequiredHidden);
                        }
                        required.push(slot.clone());
                    }
                    plain.push(slot);
                }
            }
            if !plain.is_empty() {
                unset.push((plugin, plain));
            }
            if !required.is_empty() {
                unset_required.push((plugin, required));
            }
        }

        if no_prompt {
            if unset_required.is_empty() {
                return Ok(());
            }
            for (plugin, opts) in &unset_required {
                for opt in opts {
                    error!(
                        "{}: \"{}\" is a required option, but was not set",
                        plugin_label(plugin.as_ref()),
                        opt.key
                    );
                }
            }
            return Err(PluginSetupError::UnsetRequired);
        }

        // Prompting: with defaults on only the required slots are asked for.
        let to_prompt = if defaults { unset_required } else { unset };
        for (plugin, opts) in to_prompt {
            let label = plugin_label(plugin.as_ref());
            println!("The plugin \"{label}\" has option(s):");
            for opt in opts {
                if opt.is_hidden() {
                    continue;
                }
                option_prompt(plugin.options(), &opt);
                debug!(plugin = plugin.name(), key = opt.key, "option set via prompt");
            }
        }

        Ok(())
    }
}

pub fn plugin_label(p: &dyn Plugin) -> String {
    format!("{} {}", p.name(), p.version()).trim().to_string()
}

fn prompt(msg: &str) -> String {
    print!("{msg}: ");
    let _ = io::stdout().flush();
    let mut input = String::new();
    let _ = io::stdin().lock().read_line(&mut input);
    input.trim().to_string()
}

fn option_prompt(set: &OptionSet, opt: &PluginOption) {
    if !opt.comment.is_empty() {
        println!("{}", opt.comment);
    }

    let asterisk = if opt.required { "*" } else { "" };
    let default = opt.value.display();
    let label = if !default.is_empty() && !opt.required {
        format!("    {} [{}]{}", opt.key, default, asterisk)
    } else {
        format!("    {}{}", opt.key, asterisk)
    };

    loop {
        let input = prompt(&label);
        if input.is_empty() {
            if opt.required {
                continue;
            }
            break;
        }
        match set.set(opt.key, &input) {
            Ok(_) => break,
            Err(err) => error!("{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::options::{force_workers, OptionSet, PluginOption};
    use crate::plugin::PageStream;

    struct FakePlugin {
        options: OptionSet,
        prefix: &'static str,
    }

    impl FakePlugin {
        fn new(prefix: &'static str, options: Vec<PluginOption>) -> Self {
            Self {
                options: OptionSet::new(options),
                prefix,
            }
        }
    }

    impl Plugin for FakePlugin {
        fn name(&self) -> &'static str {
            "Fake"
        }

        fn can_handle(&self, url: &str) -> bool {
            url.starts_with(self.prefix)
        }

        fn options(&self) -> &OptionSet {
            &self.options
        }

        fn open(&self, _url: &str) -> anyhow::Result<PageStream> {
            anyhow::bail!("not used")
        }

        fn finalise(&self, _error: Option<&anyhow::Error>) {}
    }

    #[test]
    fn handler_resolution() {
        let pm = PluginManager::new(vec![
            Arc::new(FakePlugin::new("a://", vec![])),
            Arc::new(FakePlugin::new("b://", vec![])),
        ]);
        let handlers =
            pm.find_handlers(&["a://x".to_string(), "b://y".to_string(), "c://z".to_string()]);
        assert_eq!(handlers[0].len(), 1);
        assert_eq!(handlers[1].len(), 1);
        assert!(handlers[2].is_empty());

        assert!(matches!(
            PluginManager::select_plugin(&handlers[2]),
            Err(PluginSetupError::NoPlugins)
        ));
        assert!(PluginManager::select_plugin(&handlers[0]).is_ok());
    }

    #[test]
    fn user_options_are_applied_case_insensitively() {
        let plugin: Arc<dyn Plugin> = Arc::new(FakePlugin::new(
            "a://",
            vec![PluginOption::string("Username", "").required()],
        ));
        let pm = PluginManager::new(vec![Arc::clone(&plugin)]);
        let mut user = HashMap::new();
        user.insert("username".to_string(), "mino".to_string());
        pm.set_options(std::slice::from_ref(&plugin), &user, false, true)
            .unwrap();
        assert_eq!(plugin.options().str_value("Username").as_deref(), Some("mino"));
    }

    #[test]
    fn unset_required_is_fatal_without_prompts() {
        let plugin: Arc<dyn Plugin> = Arc::new(FakePlugin::new(
            "a://",
            vec![PluginOption::string("Password", "").required()],
        ));
        let pm = PluginManager::new(vec![Arc::clone(&plugin)]);
        assert!(matches!(
            pm.set_options(std::slice::from_ref(&plugin), &HashMap::new(), false, true),
            Err(PluginSetupError::UnsetRequired)
        ));
    }

    #[test]
    fn hidden_options_never_count_as_required_input() {
        let plugin: Arc<dyn Plugin> =
            Arc::new(FakePlugin::new("a://", vec![force_workers(2)]));
        let pm = PluginManager::new(vec![Arc::clone(&plugin)]);
        // hidden but not required: fine without prompts
        pm.set_options(std::slice::from_ref(&plugin), &HashMap::new(), false, true)
            .unwrap();
    }
}
