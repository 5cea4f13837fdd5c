fn main() -> std::process::ExitCode {
    text2sql_lib::run()
}
