fn main() {
    sfrelay::run();
}
