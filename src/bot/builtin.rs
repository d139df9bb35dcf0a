//! Built-in command bot.
//!
//! Some commands start a short conversation: the bot then treats the
//! sender's next plain chat line as the answer. Each sender has at most one
//! conversation, and any new command replaces it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Local;
use rand::seq::IndexedRandom;
use rand::Rng;
use tokio::sync::Mutex;

use super::BotHook;
use crate::chat::Message;
use crate::config::BotConfig;
use crate::Result;

const EIGHT_BALL: &[&str] = &[
    "It is certain.",
    "It is decidedly so.",
    "Without a doubt.",
    "Yes, definitely.",
    "You may rely on it.",
    "As I see it, yes.",
    "Most likely.",
    "Outlook good.",
    "Yes.",
    "Signs point to yes.",
    "Reply hazy, try again.",
    "Ask again later.",
    "Better not tell you now.",
    "Cannot predict now.",
    "Concentrate and ask again.",
    "Don't count on it.",
    "My reply is no.",
    "My sources say no.",
    "Outlook not so good.",
    "Very doubtful.",
];

const GREETINGS: &[&str] = &["Hello", "Hi there", "Hey", "Greetings", "Welcome back"];

/// Greetings that expect an answer.
const GREETING_QUESTIONS: &[&str] = &["How are you", "How is your day going", "How is life"];

const GLOOMY_WORDS: &[&str] = &["bad", "terrible", "worst", "awful", "not"];

const DEFAULT_SIDES: u32 = 6;

const GUESS_TRIES: u32 = 5;
const GUESS_RANGE: (u32, u32) = (1, 100);

/// An answer the bot is waiting for from one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Conversation {
    Guess { answer: u32, tries_left: u32 },
    Math { answer: i64 },
    Greeting,
}

/// A reply and what to expect next from the same sender.
type Turn = (String, Option<Conversation>);

impl Conversation {
    fn answer(self, text: &str) -> Turn {
        let text = text.trim();
        match self {
            Conversation::Guess { answer, tries_left } => {
                let tries_left = tries_left.saturating_sub(1);
                let guess = text.parse::<u32>().ok();
                if guess == Some(answer) {
                    return ("Congratulations, You guessed correctly!".to_string(), None);
                }
                if tries_left == 0 {
                    return (
                        format!("You failed to guess the correct number, the answer is {answer}"),
                        None,
                    );
                }
                let next = Some(Conversation::Guess { answer, tries_left });
                let reply = match guess {
                    None => format!("Invalid number, you have {tries_left} tries left."),
                    Some(guess) if guess < answer => format!("Higher! ({tries_left} tries left)"),
                    Some(_) => format!("Lower! ({tries_left} tries left)"),
                };
                (reply, next)
            }
            Conversation::Math { answer } => match text.parse::<i64>() {
                Err(_) => (
                    "Enter a valid number as your answer.".to_string(),
                    Some(Conversation::Math { answer }),
                ),
                Ok(n) if n == answer => ("Correct! Your answer is right.".to_string(), None),
                Ok(_) => (format!("Wrong, the correct answer is {answer}."), None),
            },
            Conversation::Greeting => {
                let lower = text.to_lowercase();
                let gloomy = lower
                    .split(|c: char| !c.is_alphanumeric())
                    .any(|word| GLOOMY_WORDS.contains(&word));
                let reply = if gloomy {
                    "I hope your day gets better!"
                } else {
                    "Good to hear!"
                };
                (reply.to_string(), None)
            }
        }
    }
}

/// Answers `!`-prefixed chat lines.
pub struct CommandBot {
    name: String,
    prefix: String,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl CommandBot {
    /// Create a bot replying as `name` to lines starting with `prefix`.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(config.name.clone(), config.prefix.clone())
    }

    /// Compute the reply to a chat line from `sender`, if any.
    ///
    /// A command always gets a reply. A plain line only gets one when it
    /// answers the sender's open conversation.
    pub async fn respond(&self, payload: &str, sender: &str) -> Option<String> {
        let mut conversations = self.conversations.lock().await;
        let (reply, next) = match self.command(payload, sender) {
            Some(turn) => turn,
            None => conversations.remove(sender)?.answer(payload),
        };
        match next {
            Some(conversation) => {
                conversations.insert(sender.to_string(), conversation);
            }
            None => {
                conversations.remove(sender);
            }
        }
        Some(reply)
    }

    /// Number of senders the bot is waiting on.
    pub async fn open_conversations(&self) -> usize {
        self.conversations.lock().await.len()
    }

    fn command(&self, payload: &str, sender: &str) -> Option<Turn> {
        let body = payload.trim().strip_prefix(self.prefix.as_str())?;
        let (cmd, args) = match body.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd, args.trim()),
            None => (body, ""),
        };
        if cmd.is_empty() {
            return None;
        }

        let mut rng = rand::rng();
        let reply = match cmd.to_lowercase().as_str() {
            "ping" => "pong".to_string(),
            "hello" | "hi" | "hey" => {
                if rng.random_bool(0.5) {
                    let question = GREETING_QUESTIONS
                        .choose(&mut rng)
                        .copied()
                        .unwrap_or("How are you");
                    return Some((format!("{question}, {sender}?"), Some(Conversation::Greeting)));
                }
                let greeting = GREETINGS.choose(&mut rng).copied().unwrap_or("Hello");
                format!("{greeting}, {sender}!")
            }
            "intro" => format!(
                "I am {}. I answer chat lines starting with {}; try {}help.",
                self.name, self.prefix, self.prefix
            ),
            "echo" if args.is_empty() => "You said nothing.".to_string(),
            "echo" => format!("You said: {args}"),
            "time" => Local::now().format("It is currently %H:%M:%S.").to_string(),
            "pick" => {
                let choices: Vec<&str> = args.split_whitespace().collect();
                match choices.choose(&mut rng) {
                    Some(choice) => format!("I pick {choice}"),
                    None => format!("usage: {}pick <a> <b> ...", self.prefix),
                }
            }
            "8ball" if args.is_empty() => format!("usage: {}8ball <question>", self.prefix),
            "8ball" => {
                let answer = EIGHT_BALL.choose(&mut rng).copied().unwrap_or("Ask again later.");
                format!("Question: {args} Answer: {answer}")
            }
            "roll" => match parse_sides(args) {
                Some(sides) => format!(
                    "{sender} rolled {} (1-{sides})",
                    rng.random_range(1..=sides)
                ),
                None => format!("usage: {}roll [sides], sides from 2 to 1000", self.prefix),
            },
            "guess" => match parse_range(args) {
                Some((low, high)) => {
                    let answer = rng.random_range(low..=high);
                    return Some((
                        format!("Start guessing a number between {low} and {high}"),
                        Some(Conversation::Guess {
                            answer,
                            tries_left: GUESS_TRIES,
                        }),
                    ));
                }
                None => format!("usage: {}guess [low high]", self.prefix),
            },
            "math" => {
                let a: i64 = rng.random_range(1..=30);
                let b: i64 = rng.random_range(1..=30);
                let (op, answer) = match rng.random_range(0..3) {
                    0 => ('+', a + b),
                    1 => ('-', a - b),
                    _ => ('*', a * b),
                };
                return Some((
                    format!("What is {a}{op}{b}?"),
                    Some(Conversation::Math { answer }),
                ));
            }
            "help" => self.help(),
            _ => "No such command found".to_string(),
        };
        Some((reply, None))
    }

    fn help(&self) -> String {
        let p = &self.prefix;
        format!(
            "Bot commands: {p}ping, {p}hello, {p}intro, {p}echo <text>, {p}time, \
             {p}pick <a> <b> ..., {p}8ball <question>, {p}roll [sides], \
             {p}guess [low high], {p}math, {p}help"
        )
    }
}

fn parse_sides(args: &str) -> Option<u32> {
    if args.is_empty() {
        return Some(DEFAULT_SIDES);
    }
    args.parse::<u32>()
        .ok()
        .filter(|sides| (2..=1000).contains(sides))
}

fn parse_range(args: &str) -> Option<(u32, u32)> {
    let bounds: Vec<&str> = args.split_whitespace().collect();
    let (low, high) = match bounds.as_slice() {
        [] => GUESS_RANGE,
        [low, high] => (low.parse().ok()?, high.parse().ok()?),
        _ => return None,
    };
    (low < high).then_some((low, high))
}

#[async_trait]
impl BotHook for CommandBot {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message, sender: &str) -> Result<Vec<Message>> {
        if !message.is_chat() || sender == self.name {
            return Ok(Vec::new());
        }
        Ok(self
            .respond(&message.payload, sender)
            .await
            .map(|reply| vec![Message::chat(&self.name, reply)])
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> CommandBot {
        CommandBot::new("ChatBot", "!")
    }

    async fn start(bot: &CommandBot, sender: &str, conversation: Conversation) {
        bot.conversations
            .lock()
            .await
            .insert(sender.to_string(), conversation);
    }

    #[tokio::test]
    async fn test_unprefixed_is_ignored() {
        assert_eq!(bot().respond("hello there", "alice").await, None);
        assert_eq!(bot().respond("!", "alice").await, None);
    }

    #[tokio::test]
    async fn test_ping() {
        assert_eq!(bot().respond("!ping", "alice").await.as_deref(), Some("pong"));
        assert_eq!(bot().respond("  !PING  ", "alice").await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_echo() {
        assert_eq!(
            bot().respond("!echo hello world", "alice").await.as_deref(),
            Some("You said: hello world")
        );
    }

    #[tokio::test]
    async fn test_greeting_names_sender() {
        for _ in 0..20 {
            let bot = bot();
            let reply = bot.respond("!hi", "alice").await.unwrap();
            if reply.ends_with('?') {
                assert!(reply.ends_with(", alice?"));
                assert_eq!(bot.open_conversations().await, 1);
            } else {
                assert!(reply.ends_with(", alice!"));
                assert_eq!(bot.open_conversations().await, 0);
            }
        }
    }

    #[tokio::test]
    async fn test_greeting_follow_up() {
        let bot = bot();
        start(&bot, "alice", Conversation::Greeting).await;
        assert_eq!(
            bot.respond("pretty bad, honestly", "alice").await.as_deref(),
            Some("I hope your day gets better!")
        );
        assert_eq!(bot.respond("fine", "alice").await, None);

        start(&bot, "alice", Conversation::Greeting).await;
        assert_eq!(
            bot.respond("Great, thanks", "alice").await.as_deref(),
            Some("Good to hear!")
        );
    }

    #[tokio::test]
    async fn test_guess_game() {
        let bot = bot();
        let reply = bot.respond("!guess 1 10", "alice").await.unwrap();
        assert_eq!(reply, "Start guessing a number between 1 and 10");
        assert_eq!(bot.open_conversations().await, 1);

        start(
            &bot,
            "alice",
            Conversation::Guess {
                answer: 7,
                tries_left: GUESS_TRIES,
            },
        )
        .await;
        assert_eq!(
            bot.respond("3", "alice").await.as_deref(),
            Some("Higher! (4 tries left)")
        );
        assert_eq!(
            bot.respond("nine", "alice").await.as_deref(),
            Some("Invalid number, you have 3 tries left.")
        );
        assert_eq!(
            bot.respond("9", "alice").await.as_deref(),
            Some("Lower! (2 tries left)")
        );
        // Other senders are not part of alice's game.
        assert_eq!(bot.respond("7", "bob").await, None);
        assert_eq!(
            bot.respond(" 7 ", "alice").await.as_deref(),
            Some("Congratulations, You guessed correctly!")
        );
        assert_eq!(bot.open_conversations().await, 0);
    }

    #[tokio::test]
    async fn test_guess_game_runs_out_of_tries() {
        let bot = bot();
        start(
            &bot,
            "alice",
            Conversation::Guess {
                answer: 50,
                tries_left: 2,
            },
        )
        .await;
        assert_eq!(
            bot.respond("10", "alice").await.as_deref(),
            Some("Higher! (1 tries left)")
        );
        assert_eq!(
            bot.respond("x", "alice").await.as_deref(),
            Some("You failed to guess the correct number, the answer is 50")
        );
        assert_eq!(bot.respond("50", "alice").await, None);
    }

    #[tokio::test]
    async fn test_guess_bad_range() {
        let bot = bot();
        assert!(bot
            .respond("!guess 10 1", "alice")
            .await
            .unwrap()
            .starts_with("usage:"));
        assert!(bot
            .respond("!guess 5", "alice")
            .await
            .unwrap()
            .starts_with("usage:"));
        assert_eq!(bot.open_conversations().await, 0);
    }

    #[tokio::test]
    async fn test_math_question() {
        let bot = bot();
        let question = bot.respond("!math", "alice").await.unwrap();
        assert!(question.starts_with("What is ") && question.ends_with('?'));

        start(&bot, "alice", Conversation::Math { answer: -4 }).await;
        assert_eq!(
            bot.respond("minus four", "alice").await.as_deref(),
            Some("Enter a valid number as your answer.")
        );
        assert_eq!(
            bot.respond("-4", "alice").await.as_deref(),
            Some("Correct! Your answer is right.")
        );

        start(&bot, "alice", Conversation::Math { answer: 12 }).await;
        assert_eq!(
            bot.respond("13", "alice").await.as_deref(),
            Some("Wrong, the correct answer is 12.")
        );
        assert_eq!(bot.open_conversations().await, 0);
    }

    #[tokio::test]
    async fn test_new_command_replaces_conversation() {
        let bot = bot();
        start(&bot, "alice", Conversation::Math { answer: 12 }).await;
        assert_eq!(bot.respond("!ping", "alice").await.as_deref(), Some("pong"));
        assert_eq!(bot.respond("12", "alice").await, None);
    }

    #[tokio::test]
    async fn test_pick() {
        let reply = bot().respond("!pick red green blue", "alice").await.unwrap();
        assert!(["I pick red", "I pick green", "I pick blue"].contains(&reply.as_str()));

        let reply = bot().respond("!pick", "alice").await.unwrap();
        assert!(reply.starts_with("usage:"));
    }

    #[tokio::test]
    async fn test_8ball() {
        let reply = bot().respond("!8ball will it work?", "alice").await.unwrap();
        assert!(reply.starts_with("Question: will it work? Answer: "));
        let answer = reply.rsplit("Answer: ").next().unwrap();
        assert!(EIGHT_BALL.contains(&answer));
    }

    #[tokio::test]
    async fn test_roll() {
        let bot = bot();
        for _ in 0..20 {
            let reply = bot.respond("!roll 4", "bob").await.unwrap();
            let value: u32 = reply
                .strip_prefix("bob rolled ")
                .and_then(|rest| rest.split(' ').next())
                .and_then(|n| n.parse().ok())
                .unwrap();
            assert!((1..=4).contains(&value));
        }
        assert!(bot.respond("!roll 1", "bob").await.unwrap().starts_with("usage:"));
        assert!(bot.respond("!roll", "bob").await.unwrap().ends_with("(1-6)"));
    }

    #[tokio::test]
    async fn test_time() {
        let reply = bot().respond("!time", "alice").await.unwrap();
        assert!(reply.starts_with("It is currently "));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        assert_eq!(
            bot().respond("!dance", "alice").await.as_deref(),
            Some("No such command found")
        );
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let bot = CommandBot::from_config(&BotConfig {
            prefix: "?".to_string(),
            ..BotConfig::default()
        });
        assert_eq!(bot.respond("?ping", "a").await.as_deref(), Some("pong"));
        assert_eq!(bot.respond("!ping", "a").await, None);
        let help = bot.respond("?help", "a").await.unwrap();
        assert!(help.contains("?roll"));
        assert!(help.contains("?guess"));
    }

    #[tokio::test]
    async fn test_handle_replies_as_bot() {
        let bot = bot();
        let replies = bot
            .handle(&Message::chat("alice", "!ping"), "alice")
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sender, "ChatBot");
        assert_eq!(replies[0].payload, "pong");
    }

    #[tokio::test]
    async fn test_handle_continues_conversation() {
        let bot = bot();
        start(&bot, "alice", Conversation::Math { answer: 3 }).await;
        let replies = bot
            .handle(&Message::chat("alice", "3"), "alice")
            .await
            .unwrap();
        assert_eq!(replies[0].payload, "Correct! Your answer is right.");
    }

    #[tokio::test]
    async fn test_handle_ignores_system_and_self() {
        let bot = bot();
        assert!(bot
            .handle(&Message::system("!ping"), "system")
            .await
            .unwrap()
            .is_empty());
        assert!(bot
            .handle(&Message::chat("ChatBot", "!ping"), "ChatBot")
            .await
            .unwrap()
            .is_empty());
    }
}
