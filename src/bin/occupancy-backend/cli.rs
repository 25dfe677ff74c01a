use clap::{Parser, command};

// Some defaults; some of which can be overriden via CLI args
const CONFIG_FILE_PATH: &str = "./lot.json";
const DETECTIONS_FILE_PATH: &str = "./detections.jsonl";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Where to load the parking lot layout config
    #[arg(long="lotConfigPath",default_value_t=String::from(CONFIG_FILE_PATH))]
    pub config_path: String,

    /// Detection replay log, one JSON frame record per line
    #[arg(long="detectionsPath",default_value_t=String::from(DETECTIONS_FILE_PATH))]
    pub detections_path: String,

    /// Suppress the per-transition JSON lines, print only the final lot
    /// status
    #[arg(long = "statusOnly", default_value_t = false)]
    pub status_only: bool,

    #[arg(long = "loglevel",default_value_t=String::from("info"))]
    pub log_level: String,
}
