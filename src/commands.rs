use crate::error::CommandError;
use crate::types::ImageRequest;

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Activate,
    Deactivate,
    Clear,
    Download,
    SetSystemPrompt(String),
    SetContextSize(u32),
    SetModel(String),
    Info,
    Imagen(ImageRequest),
    ListModels,
}

impl Command {
    /// Parse `input` if it starts with `prefix`. `None` means the text is not
    /// a command at all.
    pub fn parse(input: &str, prefix: &str) -> Option<Result<Self, CommandError>> {
        if prefix.is_empty() {
            return None;
        }
        let body = input.trim_start().strip_prefix(prefix)?.trim();
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        Some(Self::from_parts(name, rest))
    }

    fn from_parts(name: &str, rest: &str) -> Result<Self, CommandError> {
        Ok(match name.to_lowercase().as_str() {
            "activer" | "activate" => Self::Activate,
            "desactiver" | "deactivate" => Self::Deactivate,
            "clear" => Self::Clear,
            "download" => Self::Download,
            "info" => Self::Info,
            "debug_listmodels" | "listmodels" => Self::ListModels,
            // Takes the rest of the line verbatim.
            "set_system_prompt" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument {
                        command: "set_system_prompt",
                        argument: "new system prompt",
                    });
                }
                Self::SetSystemPrompt(rest.to_string())
            }
            "set_context_size" => {
                let arg = first_arg(rest, "set_context_size", "size in tokens")?;
                match arg.parse::<u32>() {
                    Ok(n) if n > 0 => Self::SetContextSize(n),
                    _ => return Err(CommandError::InvalidNumber(arg)),
                }
            }
            "set_model" => Self::SetModel(first_arg(rest, "set_model", "model name")?),
            "imagen" => Self::Imagen(parse_imagen(rest)?),
            other => return Err(CommandError::Unknown(other.to_string())),
        })
    }
}

fn first_arg(rest: &str, command: &'static str, argument: &'static str) -> Result<String, CommandError> {
    split_args(rest)?
        .into_iter()
        .next()
        .ok_or(CommandError::MissingArgument { command, argument })
}

/// `imagen <prompt> [aspect_ratio] [negative_prompt]`
fn parse_imagen(rest: &str) -> Result<ImageRequest, CommandError> {
    let mut args = split_args(rest)?.into_iter();
    let prompt = args.next().ok_or(CommandError::MissingArgument {
        command: "imagen",
        argument: "prompt",
    })?;
    let mut request = ImageRequest::new(prompt);
    if let Some(ratio) = args.next() {
        if !ratio.contains(':') {
            return Err(CommandError::InvalidAspectRatio(ratio));
        }
        request.aspect_ratio = ratio;
    }
    request.negative_prompt = args.next();
    Ok(request)
}

/// Whitespace-separated arguments; double quotes group words together.
pub fn split_args(input: &str) -> Result<Vec<String>, CommandError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if in_quotes {
        return Err(CommandError::UnterminatedQuote);
    }
    if pending {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Command, CommandError> {
        Command::parse(input, "?").expect("prefixed input")
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(Command::parse("hello ?activer", "?").is_none());
    }

    #[test]
    fn french_and_english_aliases() {
        assert_eq!(parse("?activer").unwrap(), Command::Activate);
        assert_eq!(parse("?activate").unwrap(), Command::Activate);
        assert_eq!(parse("?desactiver").unwrap(), Command::Deactivate);
        assert_eq!(parse("?debug_listmodels").unwrap(), Command::ListModels);
    }

    #[test]
    fn system_prompt_keeps_the_whole_line() {
        assert_eq!(
            parse("?set_system_prompt  You are \"Ruber\", a pirate.").unwrap(),
            Command::SetSystemPrompt("You are \"Ruber\", a pirate.".into())
        );
        assert!(matches!(
            parse("?set_system_prompt"),
            Err(CommandError::MissingArgument { .. })
        ));
    }

    #[test]
    fn context_size_must_be_a_positive_integer() {
        assert_eq!(parse("?set_context_size 4096").unwrap(), Command::SetContextSize(4096));
        assert_eq!(
            parse("?set_context_size lots"),
            Err(CommandError::InvalidNumber("lots".into()))
        );
        assert!(parse("?set_context_size 0").is_err());
        assert!(parse("?set_context_size -5").is_err());
    }

    #[test]
    fn imagen_with_quoted_arguments() {
        let Command::Imagen(request) =
            parse("?imagen \"a red fox in snow\" 16:9 \"blurry, dark\"").unwrap()
        else {
            panic!("expected imagen");
        };
        assert_eq!(request.prompt, "a red fox in snow");
        assert_eq!(request.aspect_ratio, "16:9");
        assert_eq!(request.negative_prompt.as_deref(), Some("blurry, dark"));
        assert_eq!(request.count, 2);
    }

    #[test]
    fn imagen_defaults_and_ratio_check() {
        assert_eq!(parse("?imagen cat").unwrap(), Command::Imagen(ImageRequest::new("cat")));
        assert_eq!(
            parse("?imagen cat square"),
            Err(CommandError::InvalidAspectRatio("square".into()))
        );
        assert_eq!(parse("?imagen \"cat"), Err(CommandError::UnterminatedQuote));
    }

    #[test]
    fn unknown_names_parse_as_unknown() {
        assert_eq!(parse("?dance"), Err(CommandError::Unknown("dance".into())));
        assert_eq!(parse("?"), Err(CommandError::Unknown(String::new())));
        assert_eq!(parse("?? really"), Err(CommandError::Unknown("?".into())));
    }

    #[test]
    fn empty_quotes_are_an_argument() {
        assert_eq!(split_args("a \"\" b").unwrap(), vec!["a", "", "b"]);
    }
}
